// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Tag recognition shared by the tag guard and the structural parser.
//
// A tag is `<name>` or `</name>` where `name` is ASCII letters, optionally
// followed by whitespace-separated attributes before `>`. Decisions only
// look at the first MAX_TAG_LEN bytes, so they do not depend on where the
// upstream split its chunks.

/// Longest tag candidate considered before giving up.
pub const MAX_TAG_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag<'a> {
    pub name: &'a str,
    pub closing: bool,
    pub attrs: &'a str,
    /// Byte length of the whole tag including `<` and `>`.
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagScan<'a> {
    Tag(Tag<'a>),
    /// The `<` is literal text.
    NotATag,
    /// Input ended before a decision could be made.
    Incomplete,
}

/// Scan a tag at the start of `input`, which must begin with `<`.
pub fn scan_tag(input: &str) -> TagScan<'_> {
    let bytes = input.as_bytes();
    if bytes.first() != Some(&b'<') {
        return TagScan::NotATag;
    }

    let limit = bytes.len().min(MAX_TAG_LEN);
    let undecided = || {
        if bytes.len() >= MAX_TAG_LEN {
            TagScan::NotATag
        } else {
            TagScan::Incomplete
        }
    };

    let mut i = 1;
    if i >= limit {
        return undecided();
    }
    let closing = bytes[i] == b'/';
    if closing {
        i += 1;
    }

    let name_start = i;
    while i < limit && bytes[i].is_ascii_alphabetic() {
        i += 1;
    }
    if i >= limit {
        return undecided();
    }
    if i == name_start {
        return TagScan::NotATag;
    }
    let name = &input[name_start..i];

    match bytes[i] {
        b'>' => TagScan::Tag(Tag {
            name,
            closing,
            attrs: "",
            len: i + 1,
        }),
        b' ' | b'\t' | b'\r' | b'\n' => {
            let attrs_start = i;
            while i < limit {
                match bytes[i] {
                    b'>' => {
                        return TagScan::Tag(Tag {
                            name,
                            closing,
                            attrs: input[attrs_start..i].trim(),
                            len: i + 1,
                        })
                    }
                    b'<' => return TagScan::NotATag,
                    _ => i += 1,
                }
            }
            undecided()
        }
        _ => TagScan::NotATag,
    }
}

/// Escape angle brackets: `<` to `&lt;`, `>` to `&gt;`.
pub fn escape_angles(text: &str) -> String {
    text.replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(input: &str) -> Tag<'_> {
        match scan_tag(input) {
            TagScan::Tag(t) => t,
            other => panic!("expected tag for {input:?}, got {other:?}"),
        }
    }

    #[test]
    fn simple_open_and_close() {
        let t = tag("<final>rest");
        assert_eq!((t.name, t.closing, t.len), ("final", false, 7));
        let t = tag("</final>");
        assert_eq!((t.name, t.closing, t.len), ("final", true, 8));
    }

    #[test]
    fn attributes_are_captured() {
        let t = tag("<phase id=\"3\">body");
        assert_eq!(t.name, "phase");
        assert_eq!(t.attrs, "id=\"3\"");
        assert_eq!(t.len, 14);
    }

    #[test]
    fn partial_tags_are_incomplete() {
        assert_eq!(scan_tag("<"), TagScan::Incomplete);
        assert_eq!(scan_tag("</"), TagScan::Incomplete);
        assert_eq!(scan_tag("<thi"), TagScan::Incomplete);
        assert_eq!(scan_tag("<phase id=\"1"), TagScan::Incomplete);
    }

    #[test]
    fn non_tags_are_literal() {
        assert_eq!(scan_tag("< b"), TagScan::NotATag);
        assert_eq!(scan_tag("<3"), TagScan::NotATag);
        assert_eq!(scan_tag("<!-- x -->"), TagScan::NotATag);
        assert_eq!(scan_tag("<serp_queries>"), TagScan::NotATag);
        assert_eq!(scan_tag("<a href=\"x\" <b>"), TagScan::NotATag);
    }

    #[test]
    fn overlong_candidate_is_not_a_tag() {
        let long = format!("<phase {}", "x".repeat(MAX_TAG_LEN));
        assert_eq!(scan_tag(&long), TagScan::NotATag);
    }

    #[test]
    fn escape_replaces_both_brackets() {
        assert_eq!(escape_angles("<xxx>"), "&lt;xxx&gt;");
    }
}
