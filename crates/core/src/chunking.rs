use crate::models::TextChunk;
use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_MAX_CHARS: usize = 1_200;
pub const DEFAULT_OVERLAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    pub fn new(max_chars: usize, overlap: usize) -> Self {
        Self { max_chars, overlap }
    }

    /// Clamps the overlap so that forced splitting always advances.
    pub fn sanitized(self) -> Self {
        let max_chars = self.max_chars.max(1);
        let overlap = if self.overlap >= max_chars / 2 {
            max_chars / 4
        } else {
            self.overlap
        };

        Self { max_chars, overlap }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Sentence {
    text: String,
    start: usize,
    len: usize,
}

static SENTENCE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.?!]\s+").expect("sentence break pattern is valid"));

/// Splits on `.`, `?` or `!` followed by whitespace. Returned sentences are trimmed and non-empty.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut cursor = 0;

    for found in SENTENCE_BREAK.find_iter(text) {
        // The terminator is one ASCII byte and stays with its sentence.
        push_sentence(&mut sentences, &text[cursor..found.start() + 1]);
        cursor = found.end();
    }
    push_sentence(&mut sentences, &text[cursor..]);

    sentences
}

fn push_sentence(sentences: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
}

// Duplicate sentences resolve to the next occurrence after the previous match.
fn locate_sentences(text: &str) -> Vec<Sentence> {
    let mut located = Vec::new();
    let mut byte_pos = 0;
    let mut char_pos = 0;

    for sentence in split_sentences(text) {
        let len = sentence.chars().count();
        let start = match text[byte_pos..].find(&sentence) {
            Some(relative) => {
                let found = byte_pos + relative;
                let start = char_pos + text[byte_pos..found].chars().count();
                byte_pos = found + sentence.len();
                start
            }
            None => char_pos,
        };
        char_pos = start + len;

        located.push(Sentence {
            text: sentence,
            start,
            len,
        });
    }

    located
}

#[derive(Default)]
struct OpenChunk {
    pieces: Vec<String>,
    len: usize,
    start: Option<usize>,
}

impl OpenChunk {
    fn push(&mut self, piece: &str, len: usize) {
        self.pieces.push(piece.to_string());
        self.len += len + 1;
    }

    fn joined(&self) -> String {
        self.pieces.join(" ").trim().to_string()
    }

    fn reset(&mut self) {
        self.pieces.clear();
        self.len = 0;
        self.start = None;
    }
}

fn emit(chunks: &mut Vec<TextChunk>, start: usize, text: String) {
    let end = start + text.chars().count();
    chunks.push(TextChunk {
        index: chunks.len(),
        text,
        start,
        end,
    });
}

fn force_split(chunks: &mut Vec<TextChunk>, sentence: &Sentence, max_chars: usize, overlap: usize) {
    let step = max_chars - overlap;
    let mut offset = 0;
    while offset < sentence.len {
        let part: String = sentence.text.chars().skip(offset).take(max_chars).collect();
        emit(chunks, sentence.start + offset, part);
        offset += step;
    }
}

fn slice_chars(chars: &[char], start: usize, end: usize) -> String {
    let end = end.min(chars.len());
    let start = start.min(end);
    chars[start..end].iter().collect()
}

/// Breaks `text` into sentence-aligned chunks of at most `max_chars` characters, with the
/// tail of each closed chunk carried into the next one. Offsets count characters.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let ChunkingConfig { max_chars, overlap } = config.sanitized();
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut open = OpenChunk::default();

    for sentence in locate_sentences(text) {
        if open.start.is_none() {
            open.start = Some(sentence.start);
        }

        if open.len + sentence.len <= max_chars {
            open.push(&sentence.text, sentence.len);
            continue;
        }

        if open.pieces.is_empty() {
            force_split(&mut chunks, &sentence, max_chars, overlap);
            open.reset();
            continue;
        }

        let start = open.start.unwrap_or(sentence.start);
        let joined = open.joined();
        let joined_len = joined.chars().count();
        emit(&mut chunks, start, joined);

        let overlap_start = start + joined_len.saturating_sub(overlap);
        let tail = slice_chars(&chars, overlap_start, start + joined_len);
        open.reset();

        let tail = tail.trim();
        if !tail.is_empty() {
            open.push(tail, tail.chars().count());
            open.start = Some(overlap_start);
        }

        if open.len + sentence.len <= max_chars {
            if open.start.is_none() {
                open.start = Some(sentence.start);
            }
            open.push(&sentence.text, sentence.len);
        } else {
            force_split(&mut chunks, &sentence, max_chars, overlap);
            open.reset();
        }
    }

    if !open.pieces.is_empty() {
        let start = open.start.unwrap_or(0);
        emit(&mut chunks, start, open.joined());
    }

    if chunks.is_empty() {
        let leading = text.chars().take_while(|ch| ch.is_whitespace()).count();
        emit(&mut chunks, leading, text.trim().to_string());
    }

    chunks
}
