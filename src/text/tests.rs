use super::*;

#[test]
fn tokenize_lowercases_and_splits_on_punctuation() {
    let tokens = tokenize("I'm STRESSED, about work-life balance!");
    assert_eq!(tokens, vec!["im", "stressed", "about", "work", "life", "balance"]);
}

#[test]
fn tokenize_drops_apostrophes() {
    assert_eq!(tokenize("Don\u{2019}t stop"), vec!["dont", "stop"]);
    assert_eq!(tokenize("don't"), vec!["dont"]);
}

#[test]
fn content_tokens_filters_stop_words_short_tokens_and_duplicates() {
    let tokens = content_tokens("I feel so anxious and anxious at work", 3);
    assert_eq!(tokens, vec!["anxious", "work"]);
}

#[test]
fn content_tokens_empty_input() {
    assert!(content_tokens("", 3).is_empty());
    assert!(content_tokens("the and of", 1).is_empty());
}

#[test]
fn sentences_basic() {
    let text = "Hello there. How are you? I am fine!";
    let spans = sentences(text);
    let texts: Vec<&str> = spans.iter().map(|s| s.text).collect();
    assert_eq!(texts, vec!["Hello there.", "How are you?", "I am fine!"]);

    for span in &spans {
        assert_eq!(&text[span.start..span.end], span.text);
    }
}

#[test]
fn sentences_terminator_runs_and_decimals() {
    let spans = sentences("Wait... what?! Pi is 3.14 roughly.");
    let texts: Vec<&str> = spans.iter().map(|s| s.text).collect();
    assert_eq!(texts, vec!["Wait...", "what?!", "Pi is 3.14 roughly."]);
}

#[test]
fn sentences_newlines_and_trailing_fragment() {
    let spans = sentences("first line\nsecond line without stop");
    let texts: Vec<&str> = spans.iter().map(|s| s.text).collect();
    assert_eq!(texts, vec!["first line", "second line without stop"]);
}

#[test]
fn sentences_empty() {
    assert!(sentences("").is_empty());
    assert!(sentences("   \n  ").is_empty());
}

#[test]
fn normalize_collapses_case_and_punctuation() {
    assert_eq!(normalize("  Hello,   World!  "), "hello world");
    assert_eq!(normalize("I hear you."), normalize("i HEAR you"));
}
