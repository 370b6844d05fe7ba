//! Language detection and code normalization.

/// Language assumed for empty input.
pub const DEFAULT_LANGUAGE: &str = "zh";

const STOPWORDS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "is", "of", "to", "in", "that", "it", "was", "with", "for", "you"]),
    ("fr", &["le", "la", "les", "et", "est", "des", "une", "dans", "que", "pour", "pas", "du"]),
    ("de", &["der", "die", "das", "und", "ist", "nicht", "ein", "eine", "mit", "ich", "zu", "sie"]),
    ("es", &["el", "los", "las", "y", "es", "una", "por", "con", "para", "del", "que", "pero"]),
    ("it", &["il", "gli", "e", "di", "che", "una", "non", "per", "sono", "della", "con", "questo"]),
    ("pt", &["o", "os", "as", "e", "um", "uma", "não", "com", "para", "que", "do", "da"]),
];

/// Lowercase a code and fold Chinese variants to `zh`.
pub fn normalize_code(code: &str) -> String {
    let code = code.trim().to_ascii_lowercase().replace('_', "-");
    match code.as_str() {
        "zh-cn" | "zh-tw" | "zh-hans" | "zh-hant" | "zh-hk" | "zh-sg" => "zh".to_string(),
        _ => code,
    }
}

fn script_of(c: char) -> Option<&'static str> {
    match c as u32 {
        0x3040..=0x30FF | 0x31F0..=0x31FF => Some("ja"),
        0xAC00..=0xD7AF | 0x1100..=0x11FF | 0x3130..=0x318F => Some("ko"),
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF => Some("zh"),
        0x0400..=0x04FF => Some("ru"),
        0x0600..=0x06FF | 0x0750..=0x077F => Some("ar"),
        0x0900..=0x097F => Some("hi"),
        0x0E00..=0x0E7F => Some("th"),
        _ => None,
    }
}

/// Best guess of the language of `text`.
///
/// Non-Latin scripts are decided by character ranges. Kana anywhere means
/// Japanese, even among Han characters. Latin text is scored against short
/// stopword lists and falls back to English.
pub fn detect_language(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return DEFAULT_LANGUAGE.to_string();
    }

    let mut counts: [(&str, usize); 7] = [
        ("ja", 0),
        ("ko", 0),
        ("zh", 0),
        ("ru", 0),
        ("ar", 0),
        ("hi", 0),
        ("th", 0),
    ];
    let mut latin = 0usize;

    for c in text.chars() {
        if let Some(script) = script_of(c) {
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == script) {
                slot.1 += 1;
            }
        } else if c.is_alphabetic() {
            latin += 1;
        }
    }

    if counts[0].1 > 0 {
        return "ja".to_string();
    }
    let (script, count) = counts
        .iter()
        .copied()
        .max_by_key(|(_, n)| *n)
        .unwrap_or(("zh", 0));
    if count > 0 && count >= latin / 2 {
        return script.to_string();
    }
    if latin == 0 {
        return DEFAULT_LANGUAGE.to_string();
    }

    let words: Vec<String> = text
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    let mut best = ("en", 0usize);
    for (lang, stopwords) in STOPWORDS {
        let score = words.iter().filter(|w| stopwords.contains(&w.as_str())).count();
        if score > best.1 {
            best = (*lang, score);
        }
    }
    best.0.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts() {
        assert_eq!(detect_language("这是一本关于历史的书。"), "zh");
        assert_eq!(detect_language("これは本です"), "ja");
        assert_eq!(detect_language("日本語の文章です"), "ja");
        assert_eq!(detect_language("안녕하세요 세계"), "ko");
        assert_eq!(detect_language("Привет, как дела?"), "ru");
        assert_eq!(detect_language("مرحبا بالعالم"), "ar");
        assert_eq!(detect_language("नमस्ते दुनिया"), "hi");
        assert_eq!(detect_language("สวัสดีครับ"), "th");
    }

    #[test]
    fn latin_languages() {
        assert_eq!(detect_language("The cat is on the roof and it was late."), "en");
        assert_eq!(detect_language("Le chat est dans la maison et les enfants dorment."), "fr");
        assert_eq!(detect_language("Der Hund und die Katze sind nicht hier."), "de");
        assert_eq!(detect_language("El perro y los gatos están en la casa con una niña."), "es");
        assert_eq!(detect_language("Hello"), "en");
    }

    #[test]
    fn empty_defaults_to_chinese() {
        assert_eq!(detect_language("   "), "zh");
        assert_eq!(detect_language("12345 !!"), "zh");
    }

    #[test]
    fn normalizes_codes() {
        assert_eq!(normalize_code("zh-CN"), "zh");
        assert_eq!(normalize_code("zh_Hant"), "zh");
        assert_eq!(normalize_code(" EN "), "en");
    }
}
