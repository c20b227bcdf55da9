//! Markup stripping for card fields.
//!
//! Card fields are stored as lightweight HTML. Prompts only need readable plain
//! text, so [`normalize`] swaps line breaks and `&nbsp;` for spaces and then, if
//! anything tag-like is left, walks the fragment and keeps only its text nodes,
//! with a space wherever a block element opens or closes.
//! A fragment that does not parse cleanly is returned as-is (after the token
//! substitution) rather than reported.

/// Default per-field character cap for prompt payloads.
pub const DEFAULT_MAX_FIELD_CHARS: usize = 200;

/// Marker appended to truncated fields.
pub const TRUNCATION_MARKER: &str = "..";

const SPACE_TOKENS: &[&str] = &["<br>", "<br/>", "<br />", "&nbsp;"];

/// Elements whose boundaries separate words.
const BLOCK_ELEMENTS: &[&str] = &[
    "blockquote", "br", "dd", "div", "dl", "dt", "h1", "h2", "h3", "h4", "h5", "h6", "hr", "li",
    "ol", "p", "pre", "table", "td", "th", "tr", "ul",
];

/// Elements that never have a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Strip markup from a raw field. Never fails.
pub fn normalize(raw: &str) -> String {
    let mut text = raw.to_string();
    for token in SPACE_TOKENS {
        if text.contains(token) {
            text = text.replace(token, " ");
        }
    }

    if !text.contains('<') && !text.contains('&') {
        return text;
    }

    match fragment_text(&text) {
        Ok(plain) => plain,
        Err(err) => {
            tracing::debug!(error = %err, "markup fragment did not parse; keeping raw text");
            text
        }
    }
}

/// Cap `text` at `max_chars` characters, appending [`TRUNCATION_MARKER`] when cut.
pub fn truncate_field(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum FragmentError {
    #[error("unterminated tag at byte {0}")]
    UnterminatedTag(usize),
    #[error("invalid tag <{0}>")]
    InvalidTag(String),
    #[error("closing tag </{found}> does not match <{expected}>")]
    MismatchedClose { expected: String, found: String },
    #[error("stray closing tag </{0}>")]
    StrayClose(String),
    #[error("unclosed element <{0}>")]
    Unclosed(String),
}

/// Concatenate the text content of a markup fragment, discarding tags.
fn fragment_text(input: &str) -> Result<String, FragmentError> {
    let mut out = String::with_capacity(input.len());
    let mut open: Vec<String> = Vec::new();
    let mut rest = input;
    let mut offset = 0usize;

    while let Some(lt) = rest.find('<') {
        out.push_str(&decode_entities(&rest[..lt]));
        let tag_start = offset + lt;
        let after = &rest[lt + 1..];

        if let Some(comment) = after.strip_prefix("!--") {
            let end = comment
                .find("-->")
                .ok_or(FragmentError::UnterminatedTag(tag_start))?;
            let consumed = lt + 1 + 3 + end + 3;
            rest = &rest[consumed..];
            offset += consumed;
            continue;
        }

        let gt = after
            .find('>')
            .ok_or(FragmentError::UnterminatedTag(tag_start))?;
        let tag = &after[..gt];
        let consumed = lt + 1 + gt + 1;
        rest = &rest[consumed..];
        offset += consumed;

        if tag.starts_with('!') || tag.starts_with('?') {
            continue;
        }

        if let Some(name) = tag.strip_prefix('/') {
            let name = tag_name(name)?;
            push_separator(&mut out, &name);
            match open.pop() {
                Some(expected) if expected == name => {}
                Some(expected) => {
                    return Err(FragmentError::MismatchedClose {
                        expected,
                        found: name,
                    })
                }
                None => return Err(FragmentError::StrayClose(name)),
            }
            continue;
        }

        let self_closing = tag.trim_end().ends_with('/');
        let name = tag_name(tag.trim_end().trim_end_matches('/'))?;
        push_separator(&mut out, &name);
        if !self_closing && !VOID_ELEMENTS.contains(&name.as_str()) {
            open.push(name);
        }
    }
    out.push_str(&decode_entities(rest));

    match open.pop() {
        Some(name) => Err(FragmentError::Unclosed(name)),
        None => Ok(out.trim_end().to_string()),
    }
}

fn push_separator(out: &mut String, element: &str) {
    let at_word = out.chars().last().is_some_and(|c| !c.is_whitespace());
    if at_word && BLOCK_ELEMENTS.contains(&element) {
        out.push(' ');
    }
}

fn tag_name(tag: &str) -> Result<String, FragmentError> {
    let name: String = tag
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == ':')
        .collect();
    let starts_alpha = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if !starts_alpha {
        return Err(FragmentError::InvalidTag(tag.to_string()));
    }
    Ok(name.to_ascii_lowercase())
}

/// Decode the XML entities plus numeric references; unknown entities stay literal.
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &tail[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi))
        });

        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(normalize("What is ATP?"), "What is ATP?");
    }

    #[test]
    fn layout_tokens_become_spaces() {
        assert_eq!(normalize("a<br>b&nbsp;c<div>d</div>"), "a b c d");
        assert_eq!(normalize("<div>one</div><div>two</div>"), "one two");
    }

    #[test]
    fn block_elements_with_attributes_are_stripped() {
        assert_eq!(
            normalize("<p style=\"margin:0\">Mitochondria</p>"),
            "Mitochondria"
        );
        assert_eq!(
            normalize("<div class=\"x\">ATP <b>synthase</b></div>"),
            "ATP synthase"
        );
        assert_eq!(
            normalize("<ul><li>Krebs</li><li>Calvin</li></ul>"),
            "Krebs Calvin"
        );
    }

    #[test]
    fn tags_are_dropped_and_text_kept() {
        assert_eq!(
            normalize("The <b>mitochondria</b> is the <i>powerhouse</i>"),
            "The mitochondria is the powerhouse"
        );
        assert_eq!(normalize("<span class=\"x\">H<sub>2</sub>O</span>"), "H2O");
    }

    #[test]
    fn void_and_self_closing_elements_are_tolerated() {
        assert_eq!(normalize("see <img src=\"a.png\"> here<hr/>"), "see  here");
    }

    #[test]
    fn entities_are_decoded() {
        assert_eq!(normalize("<b>a &lt; b &amp;&#38; c&#x21;</b>"), "a < b && c!");
        assert_eq!(normalize("caf&eacute;"), "caf&eacute;");
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(normalize("a<!-- hidden <b> -->b"), "ab");
    }

    #[test]
    fn broken_markup_falls_back_to_substituted_text() {
        assert_eq!(normalize("x < 3<br>and y"), "x < 3 and y");
        assert_eq!(normalize("<b>unclosed"), "<b>unclosed");
        assert_eq!(normalize("<b>a</i>"), "<b>a</i>");
        assert_eq!(normalize("a</b>"), "a</b>");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_field("short", 200), "short");
        assert_eq!(truncate_field("abcdef", 3), "abc..");
        assert_eq!(truncate_field("äöüß", 2), "äö..");
        assert_eq!(truncate_field("abc", 3), "abc");
    }

    #[test]
    fn fragment_errors_are_specific() {
        assert_eq!(
            fragment_text("<b>x</i>"),
            Err(FragmentError::MismatchedClose {
                expected: "b".into(),
                found: "i".into()
            })
        );
        assert_eq!(fragment_text("<b"), Err(FragmentError::UnterminatedTag(0)));
    }
}
