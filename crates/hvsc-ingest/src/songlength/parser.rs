//! Line-oriented songlength parsers
//!
//! Both formats are parsed tolerantly: a line that cannot be understood is
//! reported through the rejection callback and skipped.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SonglengthFormat {
    /// `Songlengths.md5`: records keyed by the MD5 of the song file
    Md5,
    /// `Songlengths.txt`: the md5 record grammar, plus `/path <durations>`
    /// lines keyed by virtual path
    Txt,
}

impl SonglengthFormat {
    pub fn from_file_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            crate::classify::SONGLENGTHS_MD5 => Some(Self::Md5),
            crate::classify::SONGLENGTHS_TXT => Some(Self::Txt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    pub source: String,
    pub line_number: usize,
    pub raw: String,
    pub reason: String,
}

/// Records parsed from a single file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SonglengthTable {
    pub by_path: HashMap<String, Vec<Duration>>,
    pub by_md5: HashMap<String, Vec<Duration>>,
}

pub fn parse_songlengths(
    source: &str,
    format: SonglengthFormat,
    content: &str,
    on_reject: &mut dyn FnMut(RejectedLine),
) -> SonglengthTable {
    let mut table = SonglengthTable::default();
    // Path announced by the last `; /path` comment
    let mut pending_path: Option<String> = None;

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || (line.starts_with('[') && line.ends_with(']')) {
            continue;
        }

        let mut reject = |reason: &str| {
            on_reject(RejectedLine {
                source: source.to_string(),
                line_number: index + 1,
                raw: raw.to_string(),
                reason: reason.to_string(),
            });
        };

        if let Some(comment) = line.strip_prefix(';') {
            let comment = comment.trim();
            pending_path = comment.starts_with('/').then(|| comment.to_string());
            continue;
        }

        if format == SonglengthFormat::Txt {
            if line.starts_with('#') {
                continue;
            }
            if line.starts_with('/') {
                pending_path = None;
                let (path, durations) = match line.split_once('=') {
                    Some((path, durations)) => (path.trim(), durations),
                    None => match line.split_once(char::is_whitespace) {
                        Some((path, durations)) => (path, durations),
                        None => {
                            reject("missing durations");
                            continue;
                        }
                    },
                };
                let Some(durations) = parse_durations(durations) else {
                    reject("invalid duration");
                    continue;
                };
                table.by_path.insert(path.to_string(), durations);
                continue;
            }
        }

        let Some((hash, durations)) = line.split_once('=') else {
            reject("expected <md5>=<durations>");
            continue;
        };
        let hash = hash.trim();
        if !is_md5_hex(hash) {
            reject("invalid md5 hash");
            continue;
        }
        let Some(durations) = parse_durations(durations) else {
            reject("invalid duration");
            continue;
        };
        if let Some(path) = pending_path.take() {
            table.by_path.insert(path, durations.clone());
        }
        table.by_md5.insert(hash.to_ascii_lowercase(), durations);
    }

    table
}

fn is_md5_hex(text: &str) -> bool {
    text.len() == 32 && text.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Whitespace-separated duration tokens; `None` if any token is invalid or
/// there are none.
pub fn parse_durations(text: &str) -> Option<Vec<Duration>> {
    let mut durations = Vec::new();
    for token in text.split_whitespace() {
        // Attribute suffix such as `(G)` or `(M)`
        let value = token.split('(').next().unwrap_or("");
        if value.is_empty() {
            if token.starts_with('(') {
                continue;
            }
            return None;
        }
        durations.push(parse_duration(value)?);
    }
    (!durations.is_empty()).then_some(durations)
}

/// `m:ss`, `m:ss.fff`, `h:mm:ss[.fff]` or plain seconds (`120`, `95.5`).
pub fn parse_duration(token: &str) -> Option<Duration> {
    let parts: Vec<&str> = token.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [s] => (0, 0, *s),
        [m, s] => (0, parse_number(m)?, *s),
        [h, m, s] => {
            let minutes = parse_number(m)?;
            if minutes >= 60 {
                return None;
            }
            (parse_number(h)?, minutes, *s)
        }
        _ => return None,
    };

    let (whole, fraction) = match seconds.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (seconds, ""),
    };
    let whole = parse_number(whole)?;
    if parts.len() > 1 && whole >= 60 {
        return None;
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Millisecond precision; extra digits are truncated
    let millis_text: String = fraction.chars().chain("000".chars()).take(3).collect();
    let millis = parse_number(&millis_text)?;

    let total_secs = hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(whole)?;
    Some(Duration::from_secs(total_secs) + Duration::from_millis(millis))
}

fn parse_number(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn parse(format: SonglengthFormat, content: &str) -> (SonglengthTable, Vec<RejectedLine>) {
        let mut rejected = Vec::new();
        let table = parse_songlengths("test", format, content, &mut |r| rejected.push(r));
        (table, rejected)
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("120"), Some(secs(120)));
        assert_eq!(parse_duration("2:00"), Some(secs(120)));
        assert_eq!(parse_duration("0:04.5"), Some(Duration::from_millis(4500)));
        assert_eq!(parse_duration("3:15.123456"), Some(Duration::from_millis(195_123)));
        assert_eq!(parse_duration("1:02:03"), Some(secs(3723)));
        assert_eq!(parse_duration("95.25"), Some(Duration::from_millis(95_250)));

        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("2:75"), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("1:2:3:4"), None);
        assert_eq!(parse_duration("-5"), None);
    }

    #[test]
    fn test_parse_durations_with_attributes() {
        assert_eq!(
            parse_durations(" 0:40(G) 1:05 (M) 2:00"),
            Some(vec![secs(40), secs(65), secs(120)])
        );
        assert_eq!(parse_durations(""), None);
        assert_eq!(parse_durations("1:00 x"), None);
    }

    #[test]
    fn test_md5_file() {
        let content = "\
[Database]
; /MUSICIANS/H/Hubbard_Rob/Commando.sid
0123456789abcdef0123456789ABCDEF=4:41 0:12
; a plain comment
fedcba9876543210fedcba9876543210=0:30
";
        let (table, rejected) = parse(SonglengthFormat::Md5, content);
        assert!(rejected.is_empty());
        assert_eq!(
            table.by_md5["0123456789abcdef0123456789abcdef"],
            vec![secs(281), secs(12)]
        );
        assert_eq!(
            table.by_path["/MUSICIANS/H/Hubbard_Rob/Commando.sid"],
            vec![secs(281), secs(12)]
        );
        // A comment that is not a path clears the pending path
        assert_eq!(table.by_path.len(), 1);
        assert_eq!(table.by_md5.len(), 2);
    }

    #[test]
    fn test_md5_garbage_line_is_rejected_not_fatal() {
        let content = "abcdef0123456789abcdef0123456789=120\ngarbage-line\n";
        let (table, rejected) = parse(SonglengthFormat::Md5, content);

        assert_eq!(
            table.by_md5["abcdef0123456789abcdef0123456789"],
            vec![secs(120)]
        );
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].line_number, 2);
        assert_eq!(rejected[0].raw, "garbage-line");
        assert_eq!(rejected[0].source, "test");
    }

    #[test]
    fn test_md5_invalid_hash_and_duration() {
        let content = "abc=1:00\n0123456789abcdef0123456789abcdef=soon\n";
        let (table, rejected) = parse(SonglengthFormat::Md5, content);
        assert!(table.by_md5.is_empty());
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].reason, "invalid md5 hash");
        assert_eq!(rejected[1].reason, "invalid duration");
    }

    #[test]
    fn test_txt_file() {
        let content = "\
# path keyed lengths
/DEMOS/A/a.sid 1:00 2:00
/DEMOS/B/b.sid=0:45
DEMOS/C/c.sid 1:00
/DEMOS/D/d.sid
";
        let (table, rejected) = parse(SonglengthFormat::Txt, content);
        assert_eq!(table.by_path["/DEMOS/A/a.sid"], vec![secs(60), secs(120)]);
        assert_eq!(table.by_path["/DEMOS/B/b.sid"], vec![secs(45)]);
        assert_eq!(table.by_path.len(), 2);
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].line_number, 4);
        assert_eq!(rejected[1].reason, "missing durations");
    }

    #[test]
    fn test_txt_file_in_database_layout() {
        let content = "\
[Database]
; /MUSICIANS/H/Hubbard_Rob/Commando.sid
abcdef0123456789abcdef0123456789=3:30
; /MUSICIANS/G/Galway_Martin/Parallax.sid
0123456789abcdef0123456789abcdef=5:12(G) 0:09
";
        let (table, rejected) = parse(SonglengthFormat::Txt, content);
        assert!(rejected.is_empty());
        assert_eq!(
            table.by_md5["abcdef0123456789abcdef0123456789"],
            vec![secs(210)]
        );
        assert_eq!(
            table.by_path["/MUSICIANS/H/Hubbard_Rob/Commando.sid"],
            vec![secs(210)]
        );
        assert_eq!(
            table.by_path["/MUSICIANS/G/Galway_Martin/Parallax.sid"],
            vec![secs(312), secs(9)]
        );
    }

    #[test]
    fn test_format_from_file_name() {
        assert_eq!(
            SonglengthFormat::from_file_name("Songlengths.MD5"),
            Some(SonglengthFormat::Md5)
        );
        assert_eq!(
            SonglengthFormat::from_file_name("songlengths.txt"),
            Some(SonglengthFormat::Txt)
        );
        assert_eq!(SonglengthFormat::from_file_name("readme.txt"), None);
    }
}
