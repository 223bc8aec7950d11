//! Reply text preparation for speech output

use regex::Regex;
use std::sync::OnceLock;

struct Patterns {
    think: Regex,
    bold: Regex,
    italic: Regex,
    code: Regex,
    header: Regex,
    bullet: Regex,
    terminator: Regex,
    breaks: [Regex; 3],
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid built-in pattern {pattern}: {e}"))
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        think: compile(r"(?s)<think>.*?(</think>|$)"),
        bold: compile(r"\*\*(.*?)\*\*"),
        italic: compile(r"\*(.*?)\*"),
        code: compile(r"`{1,3}([^`]*)`{1,3}"),
        header: compile(r"(?m)^\s*#{1,6}\s*"),
        bullet: compile(r"(?m)^\s*[-*]\s+"),
        terminator: compile(r"[.!?]+(\s+|$)"),
        breaks: [
            compile(r"[,;]\s+"),
            compile(r"\s+(?:and|but|or|however|therefore|meanwhile)\s+"),
            compile(r"\s+[-–—]\s+"),
        ],
    })
}

/// Remove `<think>...</think>` reasoning blocks emitted by reasoning models.
///
/// An unterminated block swallows the rest of the text.
pub fn strip_reasoning(text: &str) -> String {
    patterns().think.replace_all(text, "").trim().to_string()
}

/// Strip markdown, expand abbreviations and collapse whitespace
pub fn clean_for_speech(text: &str) -> String {
    let p = patterns();
    let mut result = p.bold.replace_all(text, "$1").into_owned();
    result = p.italic.replace_all(&result, "$1").into_owned();
    result = p.code.replace_all(&result, "$1").into_owned();
    result = p.header.replace_all(&result, "").into_owned();
    result = p.bullet.replace_all(&result, "").into_owned();

    let abbreviations = [
        ("Mr.", "Mister"),
        ("Mrs.", "Misses"),
        ("Dr.", "Doctor"),
        ("Prof.", "Professor"),
        ("vs.", "versus"),
        ("etc.", "etcetera"),
        ("e.g.", "for example"),
        ("i.e.", "that is"),
        ("approx.", "approximately"),
    ];
    for (abbrev, expansion) in abbreviations {
        result = result.replace(abbrev, expansion);
    }

    result = result.replace('&', " and ");
    result = result.replace('%', " percent");

    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits text into speakable sentences.
///
/// A terminator (`.`, `!`, `?`) only closes a sentence once at least
/// `min_length` characters precede it. Text running past `max_length`
/// without a terminator is broken at a comma, semicolon, conjunction or
/// dash, or failing that at the middle word.
#[derive(Clone, Debug)]
pub struct SentenceSplitter {
    min_length: usize,
    max_length: usize,
    buffer: String,
}

impl Default for SentenceSplitter {
    fn default() -> Self {
        Self::new(15, 200)
    }
}

impl SentenceSplitter {
    pub fn new(min_length: usize, max_length: usize) -> Self {
        Self {
            min_length,
            max_length: max_length.max(min_length + 1),
            buffer: String::new(),
        }
    }

    /// Split a complete text in one go
    pub fn split(text: &str) -> Vec<String> {
        let mut splitter = Self::default();
        let mut sentences = splitter.push(text);
        sentences.extend(splitter.flush());
        sentences
    }

    /// Add a chunk of text and return every sentence it completes
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut sentences = Vec::new();
        while let Some(sentence) = self.extract() {
            sentences.push(sentence);
        }
        sentences
    }

    /// Return the remaining buffered text as a final sentence
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    fn extract(&mut self) -> Option<String> {
        let text = self.buffer.trim_start().to_string();
        if text.is_empty() {
            self.buffer.clear();
            return None;
        }

        // A terminator at the very end may still be followed by more text
        // ("21." then "5"), so only whitespace-terminated ones close here.
        if let Some(m) = patterns()
            .terminator
            .find_iter(&text)
            .find(|m| text[..m.start()].chars().count() >= self.min_length)
        {
            if m.as_str().ends_with(char::is_whitespace) {
                return Some(self.take(&text, m.end()));
            }
        }

        if text.chars().count() > self.max_length {
            return self.force_break(&text);
        }

        None
    }

    fn force_break(&mut self, text: &str) -> Option<String> {
        let offset = text
            .char_indices()
            .nth(self.min_length)
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        for re in &patterns().breaks {
            if let Some(m) = re.find(&text[offset..]) {
                return Some(self.take(text, offset + m.end()));
            }
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() > 10 {
            let mid = words.len() / 2;
            let sentence = words[..mid].join(" ");
            self.buffer = words[mid..].join(" ");
            return Some(sentence);
        }

        None
    }

    fn take(&mut self, text: &str, end: usize) -> String {
        let sentence = text[..end].trim().to_string();
        self.buffer = text[end..].to_string();
        sentence
    }
}
