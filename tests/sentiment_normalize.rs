// tests/sentiment_normalize.rs
use market_sentiment_ingest::sentiment::{label_polarity, normalize, SentimentAnalyzer, SentimentInput};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[test]
fn labels_map_to_fixed_polarity() {
    for (label, want) in [
        ("positive", 0.5),
        ("Positive", 0.5),
        ("negative", -0.5),
        ("neutral", 0.0),
        ("Bullish", 0.5),
        ("Somewhat-Bearish", -0.5),
        ("something else", 0.0),
    ] {
        let s = normalize(SentimentInput::Label(label));
        assert_eq!(s.score, want, "{label}");
        assert_eq!(s.subjectivity, 0.5, "{label}");
        assert_eq!(label_polarity(label), want);
    }
    assert_eq!(normalize(SentimentInput::Empty).score, 0.0);
    assert_eq!(normalize(SentimentInput::Empty).subjectivity, 0.5);
}

#[test]
fn provider_score_wins_over_label_and_text() {
    let s = normalize(SentimentInput::from_provider(Some(0.0), Some("negative"), "terrible crash"));
    assert_eq!(s.score, 0.0);
    let s = normalize(SentimentInput::from_provider(None, Some("negative"), "record surge"));
    assert_eq!(s.score, -0.5);
    let s = normalize(SentimentInput::from_provider(Some(f64::NAN), None, ""));
    assert_eq!(s.score, 0.0);
}

#[test]
fn outputs_stay_in_range_for_any_input() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..2_000 {
        let p: f64 = rng.random_range(-1e6..1e6);
        let s = normalize(SentimentInput::Polarity(p));
        assert!((-1.0..=1.0).contains(&s.score), "{p} -> {s:?}");
        assert!((0.0..=1.0).contains(&s.subjectivity));
    }
    for p in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let s = normalize(SentimentInput::Polarity(p));
        assert!((-1.0..=1.0).contains(&s.score));
    }

    let words = [
        "very", "not", "surge", "crash", "beats", "misses", "strong", "weak", "extremely", "gain", "no", "the", "fraud",
    ];
    for _ in 0..500 {
        let n = rng.random_range(0..12);
        let text: Vec<&str> = (0..n).map(|_| words[rng.random_range(0..words.len())]).collect();
        let s = SentimentAnalyzer::new().score_text(&text.join(" "));
        assert!((-1.0..=1.0).contains(&s.score), "{text:?} -> {s:?}");
        assert!((0.0..=1.0).contains(&s.subjectivity), "{text:?} -> {s:?}");
    }
}

#[test]
fn text_scoring_reads_direction() {
    let a = SentimentAnalyzer::new();
    assert!(a.score_text("Apple beats estimates on strong iPhone demand").score > 0.0);
    assert!(a.score_text("Shares plunge after fraud probe").score < 0.0);
    let plain = a.score_text("Company schedules its annual meeting");
    assert_eq!((plain.score, plain.subjectivity), (0.0, 0.5));
}
