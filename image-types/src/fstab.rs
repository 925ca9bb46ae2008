// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

/// Filesystem types mounted by the chroot itself rather than from fstab
pub const PSEUDO_FILESYSTEMS: [&str; 5] = ["devtmpfs", "proc", "sysfs", "devpts", "tmpfs"];

/// One line of `/etc/fstab`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstabEntry {
    /// Raw source field (e.g., "UUID=...", "/dev/mapper/root")
    pub source: String,
    pub target: String,
    pub fs_type: String,
    /// Mount options in the order they were written
    pub options: Vec<String>,
    pub dump: u32,
    pub pass: u32,
}

impl FstabEntry {
    pub fn new(source: impl Into<String>, target: impl Into<String>, fs_type: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fs_type: fs_type.into(),
            options: vec!["defaults".to_string()],
            dump: 0,
            pass: 0,
        }
    }

    pub fn is_pseudo_filesystem(&self) -> bool {
        PSEUDO_FILESYSTEMS.contains(&self.fs_type.as_str())
    }

    pub fn options_string(&self) -> String {
        if self.options.is_empty() {
            "defaults".to_string()
        } else {
            self.options.join(",")
        }
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|value| value == option)
    }

    /// Render the entry as a single fstab line
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            encode_field(&self.source),
            encode_field(&self.target),
            self.fs_type,
            self.options_string(),
            self.dump,
            self.pass
        )
    }
}

/// Parse fstab contents, keeping line order.
///
/// Dump and pass default to 0 when omitted. Anything after the sixth field,
/// or from a `#` field onwards, is ignored.
pub fn parse_fstab(contents: &str) -> Result<Vec<FstabEntry>> {
    let mut entries = Vec::new();

    for (number, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let malformed = || TypesError::FstabLineMalformed {
            line: number + 1,
            content: raw_line.to_string(),
        };

        let fields: Vec<&str> = line
            .split_whitespace()
            .take_while(|field| !field.starts_with('#'))
            .take(6)
            .collect();
        if fields.len() < 4 {
            return Err(malformed());
        }

        let dump = match fields.get(4) {
            Some(value) => value.parse().map_err(|_| malformed())?,
            None => 0,
        };
        let pass = match fields.get(5) {
            Some(value) => value.parse().map_err(|_| malformed())?,
            None => 0,
        };

        entries.push(FstabEntry {
            source: decode_field(fields[0]).ok_or_else(malformed)?,
            target: decode_field(fields[1]).ok_or_else(malformed)?,
            fs_type: fields[2].to_string(),
            options: fields[3]
                .split(',')
                .filter(|option| !option.is_empty())
                .map(ToString::to_string)
                .collect(),
            dump,
            pass,
        });
    }

    Ok(entries)
}

/// Render entries as fstab text, one line per entry
pub fn render_fstab(entries: &[FstabEntry]) -> String {
    let mut contents = String::new();
    for entry in entries {
        contents.push_str(&entry.to_line());
        contents.push('\n');
    }
    contents
}

// Whitespace and backslashes inside fields are written as octal escapes.
// Escapes are raw bytes, so a multi-byte character spans several of them.
fn decode_field(field: &str) -> Option<String> {
    let mut decoded = Vec::with_capacity(field.len());
    let mut rest = field;

    while let Some(position) = rest.find('\\') {
        decoded.extend_from_slice(rest[..position].as_bytes());
        let escape = &rest[position + 1..];
        let octal = escape.get(..3).and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match octal {
            Some(byte) => {
                decoded.push(byte);
                rest = &escape[3..];
            }
            None => {
                decoded.push(b'\\');
                rest = escape;
            }
        }
    }

    decoded.extend_from_slice(rest.as_bytes());
    String::from_utf8(decoded).ok()
}

fn encode_field(field: &str) -> String {
    let mut encoded = String::with_capacity(field.len());
    for character in field.chars() {
        match character {
            ' ' => encoded.push_str("\\040"),
            '\t' => encoded.push_str("\\011"),
            '\n' => encoded.push_str("\\012"),
            '\\' => encoded.push_str("\\134"),
            other => encoded.push(other),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# /etc/fstab: static file system information.
UUID=root-uuid / ext4 defaults 0 1

   # indented comment
UUID=esp-uuid /boot/efi vfat umask=0077 0 2
tmpfs /tmp tmpfs nosuid,nodev
";

    #[test]
    fn parses_entries_and_skips_comments() {
        let entries = parse_fstab(SAMPLE).unwrap();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].source, "UUID=root-uuid");
        assert_eq!(entries[0].target, "/");
        assert_eq!(entries[0].pass, 1);

        assert_eq!(entries[1].options, vec!["umask=0077"]);
        assert_eq!(entries[1].pass, 2);

        assert_eq!(entries[2].options, vec!["nosuid", "nodev"]);
        assert_eq!((entries[2].dump, entries[2].pass), (0, 0));
        assert!(entries[2].is_pseudo_filesystem());
    }

    #[test]
    fn rejects_short_lines_with_line_number() {
        let contents = "UUID=a / ext4 defaults 0 1\nUUID=b /home ext4\n";
        assert_eq!(
            parse_fstab(contents),
            Err(TypesError::FstabLineMalformed {
                line: 2,
                content: "UUID=b /home ext4".to_string(),
            })
        );
    }

    #[test]
    fn rejects_non_numeric_pass() {
        assert!(matches!(
            parse_fstab("UUID=a / ext4 defaults 0 x"),
            Err(TypesError::FstabLineMalformed { line: 1, .. })
        ));
    }

    #[test]
    fn line_round_trip_preserves_fields() {
        let original = parse_fstab("PARTUUID=1234 /var/log xfs noatime,nodev 0 2").unwrap();
        let reparsed = parse_fstab(&render_fstab(&original)).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn escapes_whitespace_in_paths() {
        let mut entry = FstabEntry::new("LABEL=data", "/mnt/my data", "ext4");
        entry.pass = 2;
        let line = entry.to_line();
        assert_eq!(line, "LABEL=data /mnt/my\\040data ext4 defaults 0 2");

        let reparsed = parse_fstab(&line).unwrap();
        assert_eq!(reparsed[0], entry);
    }

    #[test]
    fn decodes_multibyte_escapes() {
        let entries = parse_fstab("UUID=a /mnt/caf\\303\\251 ext4 defaults 0 2").unwrap();
        assert_eq!(entries[0].target, "/mnt/café");

        // a lone continuation byte is not a path
        assert!(matches!(
            parse_fstab("UUID=a /mnt/\\251 ext4 defaults 0 2"),
            Err(TypesError::FstabLineMalformed { line: 1, .. })
        ));
    }

    #[test]
    fn ignores_trailing_comments_and_extra_fields() {
        let entries = parse_fstab(
            "UUID=a / ext4 defaults 0 1 # root\n\
             UUID=b /home ext4 defaults 0 2 extra\n\
             UUID=c /srv ext4 defaults #0 2\n",
        )
        .unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!((entries[0].target.as_str(), entries[0].pass), ("/", 1));
        assert_eq!((entries[1].target.as_str(), entries[1].pass), ("/home", 2));
        assert_eq!((entries[2].dump, entries[2].pass), (0, 0));

        assert!(matches!(
            parse_fstab("UUID=d /var ext4 # defaults 0 2"),
            Err(TypesError::FstabLineMalformed { line: 1, .. })
        ));
    }

    #[test]
    fn empty_input_yields_no_entries() {
        assert!(parse_fstab("").unwrap().is_empty());
        assert!(parse_fstab("\n   \n# nothing\n").unwrap().is_empty());
    }
}
