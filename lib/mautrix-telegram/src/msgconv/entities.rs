// Copyright 2024 - developers of the `mautrix-telegram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Formatting-entity conversion.
//!
//! Telegram expresses formatting as `MessageEntity*` records carrying
//! UTF-16 offsets into the plain text; Matrix uses an HTML body. Both
//! directions live here.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};

use grammers_tl_types as tl;
use html5ever::local_name as tag;
use html5ever::tendril::StrTendril;
use html5ever::tokenizer::{
    BufferQueue, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer,
};

const CODE_LANG_PREFIX: &str = "language-";
const MATRIX_TO_PREFIX: &str = "https://matrix.to/#/";
/// Localpart prefix of ghost users, used to turn mention pills back into
/// Telegram user IDs.
const GHOST_LOCALPART_PREFIX: &str = "telegram_";

/// The length of a string as Telegram counts it: UTF-16 code units, so
/// anything outside the basic plane counts twice.
pub fn utf16_len(string: &str) -> i32 {
    string.chars().map(|c| c.len_utf16() as i32).sum()
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        '\n' => out.push_str("<br/>"),
        c => out.push(c),
    }
}

fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// HTML markup keyed by the UTF-16 offset it has to appear at.
///
/// Each entity contributes its opening markup appended at its start
/// offset and its closing markup *prepended* at its end offset, so
/// entities that opened later close first and nesting stays balanced
/// without any per-insertion ordering rules.
#[derive(Default)]
struct MarkupPlan {
    open: BTreeMap<i32, String>,
    close: BTreeMap<i32, String>,
}

impl MarkupPlan {
    fn surround(&mut self, offset: i32, length: i32, open: String, close: &str) {
        self.open.entry(offset).or_default().push_str(&open);
        self.close
            .entry(offset + length)
            .or_default()
            .insert_str(0, close);
    }

    fn is_empty(&self) -> bool {
        self.open.is_empty() && self.close.is_empty()
    }

    /// Closing markup goes first at every boundary, so an entity ending
    /// exactly where another begins produces `</a><b>` rather than
    /// interleaved tags.
    fn emit_at(&self, offset: i32, out: &mut String) {
        if let Some(markup) = self.close.get(&offset) {
            out.push_str(markup);
        }
        if let Some(markup) = self.open.get(&offset) {
            out.push_str(markup);
        }
    }

    fn render(&self, message: &str) -> String {
        let mut out = String::with_capacity(message.len() * 2);
        let mut index = 0i32;
        for c in message.chars() {
            self.emit_at(index, &mut out);
            push_escaped(&mut out, c);
            index += c.len_utf16() as i32;
        }

        // Entities ending at (or, for malformed input, past) the end of
        // the text still need their markup.
        let mut rest: Vec<i32> = self
            .close
            .range(index..)
            .map(|(&offset, _)| offset)
            .chain(self.open.range(index..).map(|(&offset, _)| offset))
            .collect();
        rest.sort_unstable();
        rest.dedup();
        for offset in rest {
            self.emit_at(offset, &mut out);
        }
        out
    }
}

/// Render a Telegram message's entities as a Matrix
/// `org.matrix.custom.html` body.
///
/// `custom_emojis` maps custom-emoji document IDs to already-transferred
/// `mxc://` URIs; unknown IDs fall back to the plain alt text.
///
/// Returns `None` when there is nothing the HTML body would add over the
/// plain one.
pub fn entities_to_matrix_html(
    message: &str,
    entities: &[tl::enums::MessageEntity],
    custom_emojis: &HashMap<i64, String>,
) -> Option<String> {
    use tl::enums::MessageEntity as ME;

    let mut plan = MarkupPlan::default();
    for entity in entities {
        match entity {
            ME::Bold(e) => plan.surround(e.offset, e.length, "<strong>".into(), "</strong>"),
            ME::Italic(e) => plan.surround(e.offset, e.length, "<em>".into(), "</em>"),
            ME::Underline(e) => plan.surround(e.offset, e.length, "<u>".into(), "</u>"),
            ME::Strike(e) => plan.surround(e.offset, e.length, "<del>".into(), "</del>"),
            ME::Code(e) => plan.surround(e.offset, e.length, "<code>".into(), "</code>"),
            ME::Pre(e) => {
                let open = if e.language.is_empty() {
                    "<pre><code>".to_string()
                } else {
                    format!(
                        "<pre><code class=\"language-{}\">",
                        escape_attribute(&e.language)
                    )
                };
                plan.surround(e.offset, e.length, open, "</code></pre>");
            }
            ME::TextUrl(e) => plan.surround(
                e.offset,
                e.length,
                format!("<a href=\"{}\">", escape_attribute(&e.url)),
                "</a>",
            ),
            ME::MentionName(e) => plan.surround(
                e.offset,
                e.length,
                format!("<a href=\"https://matrix.to/#/@telegram_{}\">", e.user_id),
                "</a>",
            ),
            ME::Blockquote(e) => {
                plan.surround(e.offset, e.length, "<blockquote>".into(), "</blockquote>")
            }
            ME::Spoiler(e) => plan.surround(
                e.offset,
                e.length,
                "<span data-mx-spoiler>".into(),
                "</span>",
            ),
            ME::CustomEmoji(e) => {
                if let Some(uri) = custom_emojis.get(&e.document_id) {
                    // The alt attribute swallows the emoji text itself.
                    plan.surround(
                        e.offset,
                        e.length,
                        format!("<img data-mx-emoticon src=\"{uri}\" alt=\""),
                        "\"/>",
                    );
                }
            }
            // Plain-text entities (urls, hashtags, bot commands, phone
            // numbers, cashtags, bank cards) render fine as-is.
            _ => {}
        }
    }

    if plan.is_empty() {
        return None;
    }
    Some(plan.render(message))
}

/// The start offset and a mutable handle on the length of a span-shaped
/// entity.
fn entity_span_mut(entity: &mut tl::enums::MessageEntity) -> Option<(i32, &mut i32)> {
    use tl::enums::MessageEntity as ME;
    Some(match entity {
        ME::Bold(e) => (e.offset, &mut e.length),
        ME::Italic(e) => (e.offset, &mut e.length),
        ME::Underline(e) => (e.offset, &mut e.length),
        ME::Strike(e) => (e.offset, &mut e.length),
        ME::Code(e) => (e.offset, &mut e.length),
        ME::Pre(e) => (e.offset, &mut e.length),
        ME::TextUrl(e) => (e.offset, &mut e.length),
        ME::MentionName(e) => (e.offset, &mut e.length),
        ME::Blockquote(e) => (e.offset, &mut e.length),
        ME::Spoiler(e) => (e.offset, &mut e.length),
        ME::Unknown(e) => (e.offset, &mut e.length),
        _ => return None,
    })
}

/// Finish the most recently opened entity the predicate accepts, giving
/// it the length implied by `end_offset`. Entities that end up empty are
/// dropped instead of kept as zero-width noise.
fn close_entity(
    entities: &mut Vec<tl::enums::MessageEntity>,
    end_offset: i32,
    select: impl Fn(&tl::enums::MessageEntity) -> bool,
) {
    let Some(pos) = entities.iter().rposition(select) else {
        return;
    };
    let Some((offset, length)) = entity_span_mut(&mut entities[pos]) else {
        return;
    };
    *length = end_offset - offset;
    if *length == 0 {
        entities.remove(pos);
    }
}

/// Parse a Matrix HTML body into plain text plus Telegram entities.
///
/// `<mx-reply>` fallbacks are stripped; mention pills pointing at ghost
/// users become `MessageEntityMentionName` records.
pub fn matrix_html_to_entities(message: &str) -> (String, Vec<tl::enums::MessageEntity>) {
    use tl::enums::MessageEntity as ME;

    struct Sink {
        text: Cell<String>,
        entities: Cell<Vec<tl::enums::MessageEntity>>,
        offset: Cell<i32>,
        reply_depth: Cell<u32>,
    }

    impl Sink {
        fn push_text(&self, text: &mut String, offset: &mut i32, what: &str) {
            text.push_str(what);
            *offset += utf16_len(what);
        }
    }

    impl TokenSink for Sink {
        type Handle = ();

        fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
            let mut text = self.text.take();
            let mut entities = self.entities.take();
            let mut offset = self.offset.get();

            let length = 0;

            if self.reply_depth.get() > 0 {
                // Inside the <mx-reply> fallback: only track nesting.
                if let Token::TagToken(Tag { kind, name, .. }) = &token {
                    if name.as_ref() == "mx-reply" {
                        match kind {
                            TagKind::StartTag => {
                                self.reply_depth.set(self.reply_depth.get() + 1)
                            }
                            TagKind::EndTag => self.reply_depth.set(self.reply_depth.get() - 1),
                        }
                    }
                }
                self.text.replace(text);
                self.entities.replace(entities);
                self.offset.replace(offset);
                return TokenSinkResult::Continue;
            }

            match token {
                Token::TagToken(Tag {
                    kind: TagKind::StartTag,
                    name,
                    self_closing: _,
                    attrs,
                }) => match name {
                    n if n.as_ref() == "mx-reply" => {
                        self.reply_depth.set(1);
                    }
                    n if n == tag!("b") || n == tag!("strong") => {
                        entities.push(tl::types::MessageEntityBold { offset, length }.into());
                    }
                    n if n == tag!("i") || n == tag!("em") => {
                        entities.push(tl::types::MessageEntityItalic { offset, length }.into());
                    }
                    n if n == tag!("s") || n == tag!("del") || n == tag!("strike") => {
                        entities.push(tl::types::MessageEntityStrike { offset, length }.into());
                    }
                    n if n == tag!("u") || n == tag!("ins") => {
                        entities.push(tl::types::MessageEntityUnderline { offset, length }.into());
                    }
                    tag!("blockquote") => {
                        entities.push(
                            tl::types::MessageEntityBlockquote {
                                offset,
                                length,
                                collapsed: false,
                            }
                            .into(),
                        );
                    }
                    tag!("span") | tag!("font") => {
                        // Only the spoiler span maps to an entity.
                        if attrs.iter().any(|a| &a.name.local == "data-mx-spoiler") {
                            entities
                                .push(tl::types::MessageEntitySpoiler { offset, length }.into());
                        } else {
                            // Remember the span so the end tag stays balanced.
                            entities.push(
                                tl::types::MessageEntityUnknown { offset, length }.into(),
                            );
                        }
                    }
                    tag!("code") => {
                        match entities.iter_mut().next_back() {
                            // `<pre><code class="language-foo">`: fill in the
                            // language instead of nesting a code entity.
                            Some(tl::enums::MessageEntity::Pre(e)) if e.length == 0 => {
                                e.language = attrs
                                    .into_iter()
                                    .find(|a| {
                                        a.name.local == tag!("class")
                                            && a.value.starts_with(CODE_LANG_PREFIX)
                                    })
                                    .map(|a| a.value[CODE_LANG_PREFIX.len()..].to_string())
                                    .unwrap_or_default();
                            }
                            _ => {
                                entities
                                    .push(tl::types::MessageEntityCode { offset, length }.into());
                            }
                        }
                    }
                    tag!("pre") => {
                        entities.push(
                            tl::types::MessageEntityPre {
                                offset,
                                length,
                                language: String::new(),
                            }
                            .into(),
                        );
                    }
                    tag!("a") => {
                        let href = attrs
                            .into_iter()
                            .find(|a| a.name.local == tag!("href"))
                            .map(|a| a.value.to_string())
                            .unwrap_or_default();

                        if let Some(user_id) = ghost_mention_target(&href) {
                            entities.push(
                                tl::types::MessageEntityMentionName {
                                    offset,
                                    length,
                                    user_id,
                                }
                                .into(),
                            );
                        } else {
                            entities.push(
                                tl::types::MessageEntityTextUrl {
                                    offset,
                                    length,
                                    url: href,
                                }
                                .into(),
                            );
                        }
                    }
                    tag!("br") => {
                        self.push_text(&mut text, &mut offset, "\n");
                    }
                    tag!("img") => {
                        // Custom emoji pills carry their alt as the text.
                        let mut alt = None;
                        let mut emoji_src = None;
                        for attr in attrs {
                            if attr.name.local == tag!("alt") || attr.name.local == tag!("title") {
                                alt.get_or_insert(attr.value.to_string());
                            } else if &attr.name.local == "data-mx-emoticon" {
                                emoji_src = Some(());
                            }
                        }
                        if let (Some(alt), Some(())) = (alt, emoji_src) {
                            self.push_text(&mut text, &mut offset, &alt);
                        }
                    }
                    _ => {}
                },
                Token::TagToken(Tag {
                    kind: TagKind::EndTag,
                    name,
                    self_closing: _,
                    attrs: _,
                }) => match name {
                    n if n == tag!("b") || n == tag!("strong") => {
                        close_entity(&mut entities, offset, |e| matches!(e, ME::Bold(_)));
                    }
                    n if n == tag!("i") || n == tag!("em") => {
                        close_entity(&mut entities, offset, |e| matches!(e, ME::Italic(_)));
                    }
                    n if n == tag!("s") || n == tag!("del") || n == tag!("strike") => {
                        close_entity(&mut entities, offset, |e| matches!(e, ME::Strike(_)));
                    }
                    n if n == tag!("u") || n == tag!("ins") => {
                        close_entity(&mut entities, offset, |e| matches!(e, ME::Underline(_)));
                    }
                    tag!("blockquote") => {
                        close_entity(&mut entities, offset, |e| matches!(e, ME::Blockquote(_)));
                    }
                    tag!("span") | tag!("font") => {
                        // Close whichever span-shaped entity is still open,
                        // spoiler or placeholder.
                        close_entity(&mut entities, offset, |e| {
                            matches!(e, ME::Spoiler(s) if s.length == 0)
                                || matches!(e, ME::Unknown(u) if u.length == 0)
                        });
                    }
                    tag!("code") => match entities.iter_mut().next_back() {
                        Some(tl::enums::MessageEntity::Pre(e)) if e.length == 0 => {}
                        _ => {
                            close_entity(&mut entities, offset, |e| matches!(e, ME::Code(_)));
                        }
                    },
                    tag!("pre") => {
                        close_entity(&mut entities, offset, |e| matches!(e, ME::Pre(_)));
                    }
                    tag!("a") => {
                        close_entity(&mut entities, offset, |e| {
                            matches!(e, ME::MentionName(_) | ME::TextUrl(_))
                        });
                    }
                    tag!("p") | tag!("div") => {
                        if !text.is_empty() && !text.ends_with('\n') {
                            self.push_text(&mut text, &mut offset, "\n");
                        }
                    }
                    _ => {}
                },
                Token::CharacterTokens(string) => {
                    text.push_str(&string);
                    offset += utf16_len(&string);
                }
                _ => {}
            }

            self.text.replace(text);
            self.entities.replace(entities);
            self.offset.replace(offset);

            TokenSinkResult::Continue
        }
    }

    let mut input = BufferQueue::default();
    input.push_back(StrTendril::from_slice(message).try_reinterpret().unwrap());

    let tok = Tokenizer::new(
        Sink {
            text: Cell::new(String::with_capacity(message.len())),
            entities: Cell::new(Vec::new()),
            offset: Cell::new(0),
            reply_depth: Cell::new(0),
        },
        Default::default(),
    );
    let _ = tok.feed(&mut input);
    tok.end();

    let Sink { text, entities, .. } = tok.sink;
    let mut text = text.take();
    let mut entities = entities.take();

    // Placeholder entities for unstyled spans never reach Telegram.
    entities.retain(|e| !matches!(e, tl::enums::MessageEntity::Unknown(_)));

    // Trailing block-element newlines are presentation, not content.
    while text.ends_with('\n') {
        text.pop();
    }

    (text, entities)
}

/// Extract a Telegram user ID out of a mention pill href.
fn ghost_mention_target(href: &str) -> Option<i64> {
    let target = href.strip_prefix(MATRIX_TO_PREFIX)?;
    let localpart = target.strip_prefix('@')?.split(':').next()?;
    localpart
        .strip_prefix(GHOST_LOCALPART_PREFIX)?
        .parse::<i64>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_leading() {
        let (text, entities) = matrix_html_to_entities("<strong>Hello</strong> world!");
        assert_eq!(text, "Hello world!");
        assert_eq!(
            entities,
            vec![tl::types::MessageEntityBold {
                offset: 0,
                length: 5
            }
            .into()]
        );
    }

    #[test]
    fn parse_emoji_offsets() {
        let (text, entities) = matrix_html_to_entities("A <em>little 🦀</em> here");
        assert_eq!(text, "A little 🦀 here");
        assert_eq!(
            entities,
            vec![tl::types::MessageEntityItalic {
                offset: 2,
                length: 9
            }
            .into()]
        );
    }

    #[test]
    fn parse_spoiler_span() {
        let (text, entities) =
            matrix_html_to_entities("shh <span data-mx-spoiler>secret</span> over");
        assert_eq!(text, "shh secret over");
        assert_eq!(
            entities,
            vec![tl::types::MessageEntitySpoiler {
                offset: 4,
                length: 6
            }
            .into()]
        );
    }

    #[test]
    fn parse_plain_span_ignored() {
        let (text, entities) = matrix_html_to_entities("a <span>b</span> c");
        assert_eq!(text, "a b c");
        assert!(entities.is_empty());
    }

    #[test]
    fn parse_mention_pill() {
        let (text, entities) = matrix_html_to_entities(
            "hey <a href=\"https://matrix.to/#/@telegram_12345:example.com\">Some One</a>",
        );
        assert_eq!(text, "hey Some One");
        assert_eq!(
            entities,
            vec![tl::types::MessageEntityMentionName {
                offset: 4,
                length: 8,
                user_id: 12345,
            }
            .into()]
        );
    }

    #[test]
    fn parse_regular_link() {
        let (text, entities) =
            matrix_html_to_entities("see <a href=\"https://example.com\">this</a>");
        assert_eq!(text, "see this");
        assert_eq!(
            entities,
            vec![tl::types::MessageEntityTextUrl {
                offset: 4,
                length: 4,
                url: "https://example.com".to_string(),
            }
            .into()]
        );
    }

    #[test]
    fn parse_pre_with_language() {
        let (text, entities) = matrix_html_to_entities(
            "<pre><code class=\"language-rust\">let x = 1;</code></pre>",
        );
        assert_eq!(text, "let x = 1;");
        assert_eq!(
            entities,
            vec![tl::types::MessageEntityPre {
                offset: 0,
                length: 10,
                language: "rust".to_string(),
            }
            .into()]
        );
    }

    #[test]
    fn parse_strips_mx_reply() {
        let (text, entities) = matrix_html_to_entities(
            "<mx-reply><blockquote><a href=\"https://matrix.to/#/!r:s/$e\">In reply to</a> \
             <a href=\"https://matrix.to/#/@telegram_1:s\">ghost</a><br/>original</blockquote>\
             </mx-reply>the <b>actual</b> reply",
        );
        assert_eq!(text, "the actual reply");
        assert_eq!(
            entities,
            vec![tl::types::MessageEntityBold {
                offset: 4,
                length: 6
            }
            .into()]
        );
    }

    #[test]
    fn parse_br_and_paragraphs() {
        let (text, entities) = matrix_html_to_entities("<p>one</p><p>two<br/>three</p>");
        assert_eq!(text, "one\ntwo\nthree");
        assert!(entities.is_empty());
    }

    #[test]
    fn parse_empty_entity_is_dropped() {
        let (text, entities) = matrix_html_to_entities("a <strong></strong>b");
        assert_eq!(text, "a b");
        assert!(entities.is_empty());
    }

    #[test]
    fn utf16_lengths() {
        assert_eq!(utf16_len("plain"), 5);
        // Astral-plane characters take a surrogate pair each.
        assert_eq!(utf16_len("🦀"), 2);
        assert_eq!(utf16_len("a🦀b"), 4);
    }

    #[test]
    fn generate_simple() {
        let html = entities_to_matrix_html(
            "Some bold here",
            &[tl::types::MessageEntityBold {
                offset: 5,
                length: 4,
            }
            .into()],
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(html, "Some <strong>bold</strong> here");
    }

    #[test]
    fn generate_escapes_text() {
        let html = entities_to_matrix_html(
            "1 < 2 & 4 > 3",
            &[tl::types::MessageEntityItalic {
                offset: 0,
                length: 1,
            }
            .into()],
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(html, "<em>1</em> &lt; 2 &amp; 4 &gt; 3");
    }

    #[test]
    fn generate_escapes_attributes() {
        let html = entities_to_matrix_html(
            "link",
            &[tl::types::MessageEntityTextUrl {
                offset: 0,
                length: 4,
                url: "https://example.com/?a=1&b=\"2\"".to_string(),
            }
            .into()],
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(
            html,
            "<a href=\"https://example.com/?a=1&amp;b=&quot;2&quot;\">link</a>"
        );
    }

    #[test]
    fn generate_nothing_without_entities() {
        assert_eq!(
            entities_to_matrix_html("plain", &[], &HashMap::new()),
            None
        );
    }

    #[test]
    fn generate_spoiler_and_mention() {
        let html = entities_to_matrix_html(
            "spoiled mention",
            &[
                tl::types::MessageEntitySpoiler {
                    offset: 0,
                    length: 7,
                }
                .into(),
                tl::types::MessageEntityMentionName {
                    offset: 8,
                    length: 7,
                    user_id: 777,
                }
                .into(),
            ],
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(
            html,
            "<span data-mx-spoiler>spoiled</span> \
             <a href=\"https://matrix.to/#/@telegram_777\">mention</a>"
        );
    }

    #[test]
    fn generate_nested_entities_close_in_order() {
        // Bold spans the whole text, italic only the middle: the inner
        // entity has to close before the outer one.
        let html = entities_to_matrix_html(
            "abcd",
            &[
                tl::types::MessageEntityBold {
                    offset: 0,
                    length: 4,
                }
                .into(),
                tl::types::MessageEntityItalic {
                    offset: 2,
                    length: 2,
                }
                .into(),
            ],
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(html, "<strong>ab<em>cd</em></strong>");
    }

    #[test]
    fn generate_emoji_offsets() {
        // The crab is one character but two UTF-16 code units; the entity
        // offsets are in code units.
        let html = entities_to_matrix_html(
            "🦀 bold",
            &[tl::types::MessageEntityBold {
                offset: 3,
                length: 4,
            }
            .into()],
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(html, "🦀 <strong>bold</strong>");
    }

    #[test]
    fn round_trip_matrix_html() {
        let html = "Some <strong>bold</strong>, <em>italics</em>, <code>code</code> and \
                    <span data-mx-spoiler>spoilers</span>";
        let (text, entities) = matrix_html_to_entities(html);
        let generated = entities_to_matrix_html(&text, &entities, &HashMap::new()).unwrap();
        assert_eq!(generated, html);
    }
}
