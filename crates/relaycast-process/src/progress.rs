//! Encoder progress line parsing.
//!
//! Progress lines look like
//! `frame=  120 fps= 30 q=28.0 size=     512kB time=00:00:04.00 bitrate=1048.6kbits/s speed=1x`
//! and are matched heuristically: a line is progress when it carries both a
//! `frame=` and an `fps=` token. Values may be padded after the `=`.

use relaycast_ipc::EncoderProgress;

/// Parse a progress line, or `None` if the line is not one.
pub fn parse_progress(line: &str) -> Option<EncoderProgress> {
    let frame = token_value(line, "frame=")?;
    let fps = token_value(line, "fps=")?;

    let frame = leading_number(frame)?.parse::<u64>().ok()?;
    let fps = leading_number(fps)?.parse::<f64>().ok()?;

    let bitrate_kbps = token_value(line, "bitrate=")
        .and_then(|v| v.strip_suffix("kbits/s"))
        .and_then(|v| v.parse::<f64>().ok());

    let size_kb = token_value(line, "size=")
        .or_else(|| token_value(line, "Lsize="))
        .and_then(leading_number)
        .and_then(|v| v.parse::<u64>().ok());

    Some(EncoderProgress {
        frame,
        fps,
        bitrate_kbps,
        size_kb,
    })
}

/// Value following `key` where `key` starts a whitespace-separated token.
fn token_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut search_from = 0;

    while let Some(offset) = line[search_from..].find(key) {
        let start = search_from + offset;
        let at_boundary = line[..start]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);

        if at_boundary {
            let rest = line[start + key.len()..].trim_start();
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            return Some(&rest[..end]).filter(|v| !v.is_empty());
        }

        search_from = start + key.len();
    }

    None
}

/// Longest prefix made of digits and at most one decimal point.
fn leading_number(value: &str) -> Option<&str> {
    let mut seen_dot = false;
    let end = value
        .char_indices()
        .find(|&(_, c)| {
            if c == '.' && !seen_dot {
                seen_dot = true;
                false
            } else {
                !c.is_ascii_digit()
            }
        })
        .map_or(value.len(), |(i, _)| i);

    Some(&value[..end]).filter(|v| !v.is_empty() && *v != ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_progress_line() {
        let line = "frame=  120 fps= 30 q=28.0 size=     512kB time=00:00:04.00 bitrate=1048.6kbits/s speed=1.0x";
        let progress = parse_progress(line).unwrap();
        assert_eq!(progress.frame, 120);
        assert_eq!(progress.fps, 30.0);
        assert_eq!(progress.bitrate_kbps, Some(1048.6));
        assert_eq!(progress.size_kb, Some(512));
    }

    #[test]
    fn test_unknown_values() {
        let line = "frame=    1 fps=0.0 q=0.0 size=N/A time=00:00:00.00 bitrate=N/A speed=N/A";
        let progress = parse_progress(line).unwrap();
        assert_eq!(progress.frame, 1);
        assert_eq!(progress.fps, 0.0);
        assert_eq!(progress.bitrate_kbps, None);
        assert_eq!(progress.size_kb, None);
    }

    #[test]
    fn test_final_summary_line() {
        let line = "frame=  300 fps= 29.97 q=-1.0 Lsize=    2048KB time=00:00:10.00 bitrate=1677.7kbits/s";
        let progress = parse_progress(line).unwrap();
        assert_eq!(progress.frame, 300);
        assert_eq!(progress.fps, 29.97);
        assert_eq!(progress.size_kb, Some(2048));
    }

    #[test]
    fn test_non_progress_lines() {
        assert!(parse_progress("Input #0, dshow, from 'video=Camera':").is_none());
        assert!(parse_progress("frame=12 but no rate").is_none());
        assert!(parse_progress("keyframe=1 fps=30").is_none());
    }
}
