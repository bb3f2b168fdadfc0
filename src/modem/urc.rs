//! Parsers for AT responses and unsolicited result codes.
//!
//! Modem output is line-oriented but arrives in arbitrary chunk boundaries;
//! all parsers here take the full accumulated response text and are pure,
//! so the state machine around them can be driven from scripted transcripts
//! in tests.

/// Call states reported by `+CLCC` rows.
pub mod clcc_stat {
    pub const ACTIVE: u8 = 0;
    pub const HELD: u8 = 1;
    pub const DIALING: u8 = 2;
    pub const ALERTING: u8 = 3;
    pub const INCOMING: u8 = 4;
    pub const WAITING: u8 = 5;
}

/// All `stat` fields from `+CLCC:` rows in a response, in order.
///
/// Row format: `+CLCC: <id>,<dir>,<stat>,<mode>,<mpty>[,"<number>",<type>]`.
#[must_use]
pub fn parse_clcc_stats(response: &str) -> Vec<u8> {
    response
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("+CLCC:")?;
            let stat = rest.split(',').nth(2)?.trim();
            stat.parse::<u8>().ok()
        })
        .collect()
}

/// The first `+CLCC` stat, if any.
#[must_use]
pub fn parse_clcc_stat(response: &str) -> Option<u8> {
    parse_clcc_stats(response).into_iter().next()
}

/// Caller id from a `+CLIP: "<number>",<type>` line.
#[must_use]
pub fn parse_clip_number(response: &str) -> Option<String> {
    let idx = response.find("+CLIP:")?;
    let rest = &response[idx..];
    let number = rest.split('"').nth(1)?;
    if number.is_empty() {
        None
    } else {
        Some(number.to_owned())
    }
}

/// Storage index from a `+CMTI: "SM",<index>` notification.
#[must_use]
pub fn parse_cmti_index(response: &str) -> Option<String> {
    let idx = response.find("+CMTI:")?;
    let line = response[idx..].lines().next()?;
    let index = line.split(',').nth(1)?.trim();
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        None
    } else {
        Some(index.to_owned())
    }
}

/// Sender and body from a `+CMGR` read response.
///
/// Header: `+CMGR: "<status>","<sender>",,"<timestamp>"`, body on the
/// following line. The body is UCS-2 decoded when it looks hex-encoded.
#[must_use]
pub fn parse_cmgr(response: &str) -> Option<(String, String)> {
    let mut lines = response.lines();
    let header = loop {
        let line = lines.next()?;
        if line.trim_start().starts_with("+CMGR:") {
            break line;
        }
    };

    let sender = header
        .split(',')
        .nth(1)?
        .trim()
        .trim_matches('"')
        .to_owned();

    let body = lines
        .map(str::trim)
        .find(|line| !line.is_empty() && *line != "OK")?;

    Some((sender, decode_ucs2_hex(body)))
}

/// Decode a UCS-2 hex-encoded SMS body to UTF-8.
///
/// The modem hex-encodes bodies containing characters outside GSM-7 (smart
/// quotes, emoji). Anything that does not look like UCS-2 hex passes
/// through unchanged.
#[must_use]
pub fn decode_ucs2_hex(body: &str) -> String {
    if body.is_empty() || body.len() % 4 != 0 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return body.to_owned();
    }

    let units: Vec<u16> = body
        .as_bytes()
        .chunks(4)
        .filter_map(|chunk| {
            let text = std::str::from_utf8(chunk).ok()?;
            u16::from_str_radix(text, 16).ok()
        })
        .collect();

    match String::from_utf16(&units) {
        Ok(decoded) => decoded,
        Err(_) => body.to_owned(),
    }
}

/// RSSI from a `+CSQ: <rssi>,<ber>` response (0-31, 99 unknown).
#[must_use]
pub fn parse_csq(response: &str) -> Option<i32> {
    let idx = response.find("+CSQ:")?;
    let rest = response[idx + 5..].trim_start();
    let value = rest.split(|c: char| c == ',' || c.is_whitespace()).next()?;
    value.parse().ok()
}

/// Operator name from a `+COPS?` response.
#[must_use]
pub fn parse_cops_operator(response: &str) -> Option<String> {
    let idx = response.find("+COPS:")?;
    let name = response[idx..].split('"').nth(1)?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}
