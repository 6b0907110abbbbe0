//! Codec for the structured filenames the CAM server reports.
//!
//! Every completed acquisition is announced with a filename following a
//! fixed token grammar, e.g.
//!
//! ```text
//! image--L0003--S00--M00--U00--V00--J07--E00--O00--X00--Y00--T0003--Z00--C01.ome.tif
//! ```
//!
//! The tokens appear in a fixed order, each carrying a one-letter tag and a
//! zero-padded decimal payload. This module parses such names into
//! [`FilenameMetadata`] and reconstructs them byte-for-byte, which is how
//! sibling files for other channels (`C` token) and other Z slices (`Z`
//! token) are derived. Parsing and encoding are pure; no I/O happens here.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::{CamError, CamResult};

/// Extension every CAM export carries.
const EXTENSION: &str = ".ome.tif";

/// Master pattern for the CAM filename grammar. One pass, anchored at both
/// ends; each numeric group keeps its leading zeros.
#[allow(clippy::expect_used)]
static FILENAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^(?P<prefix>.*?)
        --L(?P<loop_>[0-9]+)
        --S(?P<slide>[0-9]+)
        --M(?P<m>[0-9]+)
        --U(?P<u>[0-9]+)
        --V(?P<v>[0-9]+)
        --J(?P<job>[0-9]+)
        --E(?P<e>[0-9]+)
        --O(?P<o>[0-9]+)
        --X(?P<x>[0-9]+)
        --Y(?P<y>[0-9]+)
        --T(?P<t>[0-9]+)
        --Z(?P<z>[0-9]+)
        --C(?P<c>[0-9]+)
        (?P<suffix>.*)
        \.ome\.tif$",
    )
    .expect("filename grammar pattern is valid")
});

/// One tagged numeric token, e.g. `--U04`.
///
/// Both representations are kept: the original token text is needed to
/// reconstruct filenames byte-identically, the parsed integer feeds
/// measurement export and coordinate math. Internal logic must use
/// [`Field::value`]; the text only crosses the wire/filename boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    token: String,
    value: i32,
}

impl Field {
    fn parse(tag: char, digits: &str) -> CamResult<Self> {
        let value = digits
            .parse::<i32>()
            .map_err(|_| CamError::MalformedFilename(format!("--{tag}{digits}")))?;
        Ok(Self {
            token: format!("--{tag}{digits}"),
            value,
        })
    }

    /// The full token text, including the `--` delimiter and tag letter.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The integer payload with tag and leading zeros stripped.
    pub fn value(&self) -> i32 {
        self.value
    }

    /// Width of the digit payload in the original token.
    fn digit_width(&self) -> usize {
        self.token.len() - 3
    }

    /// A sibling token with the same tag and digit width but a different
    /// value. Values wider than the original payload keep all their digits
    /// rather than being truncated.
    fn with_value(&self, value: i32) -> Self {
        let tag = &self.token[2..3];
        Self {
            token: format!("--{tag}{value:0width$}", width = self.digit_width()),
            value,
        }
    }
}

/// Parsed form of one CAM filename.
///
/// Law: `parse(name).encode() == name` for every name matching the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilenameMetadata {
    /// Free text before the first tagged token; may contain path separators
    /// when the server reports a relative path.
    pub prefix: String,
    pub loop_index: Field,
    pub slide: Field,
    pub chamber_m: Field,
    pub chamber_u: Field,
    pub chamber_v: Field,
    pub job: Field,
    pub e_field: Field,
    pub other: Field,
    pub x: Field,
    pub y: Field,
    pub timepoint: Field,
    pub z: Field,
    pub channel: Field,
    /// Free text between the channel token and the extension.
    pub suffix: String,
}

impl FilenameMetadata {
    /// Parse a filename against the grammar.
    ///
    /// Fails with [`CamError::MalformedFilename`]; callers must treat that
    /// as fatal for the notification carrying the name.
    pub fn parse(name: &str) -> CamResult<Self> {
        let caps = FILENAME_PATTERN
            .captures(name)
            .ok_or_else(|| CamError::MalformedFilename(name.to_string()))?;

        let group = |g: &str| -> &str {
            // Anchored pattern matched, so every group participated.
            caps.name(g).map(|m| m.as_str()).unwrap_or_default()
        };

        Ok(Self {
            prefix: group("prefix").to_string(),
            loop_index: Field::parse('L', group("loop_"))?,
            slide: Field::parse('S', group("slide"))?,
            chamber_m: Field::parse('M', group("m"))?,
            chamber_u: Field::parse('U', group("u"))?,
            chamber_v: Field::parse('V', group("v"))?,
            job: Field::parse('J', group("job"))?,
            e_field: Field::parse('E', group("e"))?,
            other: Field::parse('O', group("o"))?,
            x: Field::parse('X', group("x"))?,
            y: Field::parse('Y', group("y"))?,
            timepoint: Field::parse('T', group("t"))?,
            z: Field::parse('Z', group("z"))?,
            channel: Field::parse('C', group("c"))?,
            suffix: group("suffix").to_string(),
        })
    }

    /// Reconstruct the filename by concatenation in grammar order.
    pub fn encode(&self) -> String {
        let mut name = String::with_capacity(self.prefix.len() + self.suffix.len() + 96);
        name.push_str(&self.prefix);
        for field in [
            &self.loop_index,
            &self.slide,
            &self.chamber_m,
            &self.chamber_u,
            &self.chamber_v,
            &self.job,
            &self.e_field,
            &self.other,
            &self.x,
            &self.y,
            &self.timepoint,
            &self.z,
            &self.channel,
        ] {
            name.push_str(field.token());
        }
        name.push_str(&self.suffix);
        name.push_str(EXTENSION);
        name
    }

    /// Sibling metadata with only the channel token substituted.
    pub fn with_channel(&self, channel: i32) -> Self {
        let mut md = self.clone();
        md.channel = self.channel.with_value(channel);
        md
    }

    /// Sibling metadata with only the Z-position token substituted.
    pub fn with_z(&self, z: i32) -> Self {
        let mut md = self.clone();
        md.z = self.z.with_value(z);
        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str =
        "image--L0003--S00--M00--U00--V00--J07--E00--O00--X00--Y00--T0003--Z00--C01.ome.tif";

    #[test]
    fn roundtrip_is_byte_identical() {
        let md = FilenameMetadata::parse(NAME).unwrap();
        assert_eq!(md.encode(), NAME);
    }

    #[test]
    fn fields_keep_token_and_value() {
        let md = FilenameMetadata::parse(
            "scan--L0001--S01--M00--U04--V06--J02--E03--O00--X12--Y09--T0011--Z05--C02.ome.tif",
        )
        .unwrap();
        assert_eq!(md.chamber_u.token(), "--U04");
        assert_eq!(md.chamber_u.value(), 4);
        assert_eq!(md.loop_index.value(), 1);
        assert_eq!(md.job.value(), 2);
        assert_eq!(md.timepoint.value(), 11);
        assert_eq!(md.z.value(), 5);
        assert_eq!(md.prefix, "scan");
        assert_eq!(md.suffix, "");
    }

    #[test]
    fn prefix_may_carry_a_relative_path() {
        let md = FilenameMetadata::parse(
            "chamber--U01--V01/image--L0000--S00--M00--U01--V01--J07--E00--O00--X00--Y00--T0000--Z02--C00.ome.tif",
        )
        .unwrap();
        assert_eq!(md.prefix, "chamber--U01--V01/image");
        assert_eq!(md.chamber_u.value(), 1);
    }

    #[test]
    fn channel_substitution_touches_one_token() {
        let md = FilenameMetadata::parse(NAME).unwrap();
        let sibling = md.with_channel(3).encode();
        assert_eq!(sibling, NAME.replace("--C01", "--C03"));
        // Everything else byte-identical.
        assert_eq!(sibling.replace("--C03", "--C01"), NAME);
    }

    #[test]
    fn z_substitution_preserves_digit_width() {
        let md = FilenameMetadata::parse(NAME).unwrap();
        assert_eq!(
            md.with_z(7).encode(),
            NAME.replace("--Z00", "--Z07"),
        );
        // A wider Z payload keeps its width.
        let wide = FilenameMetadata::parse(&NAME.replace("--Z00", "--Z000")).unwrap();
        assert_eq!(wide.with_z(12).encode(), NAME.replace("--Z00", "--Z012"));
    }

    #[test]
    fn substitution_never_truncates_large_values() {
        let md = FilenameMetadata::parse(NAME).unwrap();
        assert_eq!(md.with_z(123).encode(), NAME.replace("--Z00", "--Z123"));
    }

    #[test]
    fn suffix_survives_roundtrip() {
        let name = NAME.replace("--C01.ome.tif", "--C01_extra.ome.tif");
        let md = FilenameMetadata::parse(&name).unwrap();
        assert_eq!(md.suffix, "_extra");
        assert_eq!(md.encode(), name);
    }

    #[test]
    fn rejects_names_outside_the_grammar() {
        for bad in [
            "not-a-cam-file.tif",
            "image--L0003--S00.ome.tif",
            "image--L0003--S00--M00--U00--V00--J07--E00--O00--X00--Y00--T0003--Z00--C01.tif",
            "",
        ] {
            match FilenameMetadata::parse(bad) {
                Err(CamError::MalformedFilename(name)) => assert_eq!(name, bad),
                other => panic!("expected MalformedFilename for {bad:?}, got {other:?}"),
            }
        }
    }
}
