//! Line-oriented LDIF reader
//!
//! A blank line or a `#` comment closes the open block, a `dn:` line opens
//! a new one, and every other `key: value` line appends to the open block.
//! `key:: value` carries base64. Problems are recorded on the block so one
//! bad block never hides the blocks after it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::debug;

use crate::record::LdifBlock;

/// Split `text` into blocks in file order
pub fn parse(text: &str) -> Vec<LdifBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<LdifBlock> = None;
    let mut preamble = true;

    for (index, raw) in text.lines().enumerate() {
        let number = index + 1;
        let line = raw.trim_end_matches('\r');

        if line.trim().is_empty() || line.starts_with('#') {
            flush(&mut current, &mut blocks);
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            open(&mut current, number)
                .mark_malformed(format!("line {} is a folded continuation", number));
            continue;
        }

        let (key, value) = match split_line(line) {
            Ok(pair) => pair,
            Err(problem) => {
                open(&mut current, number).mark_malformed(format!("line {}: {}", number, problem));
                continue;
            }
        };

        if preamble && current.is_none() && key.eq_ignore_ascii_case("version") {
            debug!(version = %value, "Skipping LDIF version line");
            continue;
        }
        preamble = false;

        if key.eq_ignore_ascii_case("dn") {
            flush(&mut current, &mut blocks);
            current = Some(LdifBlock::with_dn(number, value));
        } else {
            open(&mut current, number).push(key, value);
        }
    }

    flush(&mut current, &mut blocks);
    blocks
}

fn open(current: &mut Option<LdifBlock>, line: usize) -> &mut LdifBlock {
    current.get_or_insert_with(|| LdifBlock::new(line))
}

fn flush(current: &mut Option<LdifBlock>, blocks: &mut Vec<LdifBlock>) {
    if let Some(block) = current.take() {
        if !block.is_empty() {
            blocks.push(block);
        }
    }
}

/// `key: value` or `key:: base64`
fn split_line(line: &str) -> Result<(&str, String), String> {
    let (key, rest) = line
        .split_once(':')
        .ok_or_else(|| "no attribute separator".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("empty attribute name".to_string());
    }

    if let Some(encoded) = rest.strip_prefix(':') {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| format!("invalid base64 value for {}: {}", key, e))?;
        let value = String::from_utf8(bytes)
            .map_err(|_| format!("base64 value for {} is not UTF-8", key))?;
        return Ok((key, value));
    }

    if rest.starts_with('<') {
        return Err(format!("URL values are not supported ({})", key));
    }

    Ok((key, rest.trim().to_string()))
}
