//! Well-known timestamp prefixes used to sense whether a log stream carries
//! one message per line or one message spread across many lines.

use std::sync::LazyLock;

use regex::bytes::Regex;

// The catalogue is compiled anchored at the start of the line since the
// patterns describe message prefixes, not arbitrary content.
static WELL_KNOWN_TIMESTAMP_FORMATS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // 2021-01-01T12:00:00.000Z
        r"\d+-\d+-\d+T\d+:\d+:\d+(\.\d+)?(Z\d*:?\d*)?",
        // Mon Jan  2 15:04:05 2021
        r"[A-Za-z_]+ [A-Za-z_]+ +\d+ \d+:\d+:\d+ \d+",
        // Mon Jan  2 15:04:05 UTC 2021
        r"[A-Za-z_]+ [A-Za-z_]+ +\d+ \d+:\d+:\d+( [A-Za-z_]+ \d+)?",
        // Mon Jan 02 15:04:05 -0700 2021
        r"[A-Za-z_]+ [A-Za-z_]+ \d+ \d+:\d+:\d+ [\-\+]\d+ \d+",
        // 02 Jan 21 15:04 UTC
        r"\d+ [A-Za-z_]+ \d+ \d+:\d+ [A-Za-z_]+",
        // 02 Jan 21 15:04 -0700
        r"\d+ [A-Za-z_]+ \d+ \d+:\d+ -\d+",
        // Monday, 02-Jan-21 15:04:05 UTC
        r"[A-Za-z_]+, \d+-[A-Za-z_]+-\d+ \d+:\d+:\d+ [A-Za-z_]+",
        // Mon, 02 Jan 2021 15:04:05 UTC
        r"[A-Za-z_]+, \d+ [A-Za-z_]+ \d+ \d+:\d+:\d+ [A-Za-z_]+",
        // Mon, 02 Jan 2021 15:04:05 -0700
        r"[A-Za-z_]+, \d+ [A-Za-z_]+ \d+ \d+:\d+:\d+ -\d+",
        // 2021-01-01T12:00:00.000000000Z07:00
        r"\d+-\d+-\d+[A-Za-z_]+\d+:\d+:\d+\.\d+[A-Za-z_]+\d+:\d+",
        // 2021-01-01 12:00:00,000
        r"\d+-\d+-\d+ \d+:\d+:\d+(,\d+)?",
    ]
    .iter()
    .map(|format| {
        Regex::new(&format!("^{format}")).expect("built-in timestamp pattern must compile")
    })
    .collect()
});

/// Returns the catalogue of timestamp prefixes, in priority order.
pub(crate) fn well_known_timestamp_formats() -> &'static [Regex] {
    &WELL_KNOWN_TIMESTAMP_FORMATS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_well_known_prefixes() {
        let samples: &[&[u8]] = &[
            b"2021-01-01T12:00:00Z error: something broke",
            b"2021-01-01T12:00:00.123Z error: something broke",
            b"Mon Jan  2 15:04:05 2021 error",
            b"Mon Jan  2 15:04:05 UTC 2021 error",
            b"Mon Jan 02 15:04:05 -0700 2021 error",
            b"02 Jan 21 15:04 UTC error",
            b"02 Jan 21 15:04 -0700 error",
            b"Monday, 02-Jan-21 15:04:05 UTC error",
            b"Mon, 02 Jan 2021 15:04:05 UTC error",
            b"Mon, 02 Jan 2021 15:04:05 -0700 error",
            b"2021-01-01T12:00:00.000000000Z07:00 error",
            b"2021-01-01 12:00:00,123 INFO error",
            b"2021-01-01 12:00:00 INFO error",
        ];

        for sample in samples {
            assert!(
                well_known_timestamp_formats()
                    .iter()
                    .any(|format| format.is_match(sample)),
                "no format matched {:?}",
                String::from_utf8_lossy(sample)
            );
        }
    }

    #[test]
    fn does_not_match_timestamps_past_the_line_start() {
        let continuation: &[u8] = b"    at frame (2021-01-01 12:00:00)";
        assert!(
            !well_known_timestamp_formats()
                .iter()
                .any(|format| format.is_match(continuation))
        );
    }

    #[test]
    fn does_not_match_bare_content() {
        let samples: &[&[u8]] = &[b"", b"caused by: connection reset", b"{\"level\":\"info\"}"];
        for sample in samples {
            assert!(
                !well_known_timestamp_formats()
                    .iter()
                    .any(|format| format.is_match(sample)),
                "a format matched {:?}",
                String::from_utf8_lossy(sample)
            );
        }
    }
}
