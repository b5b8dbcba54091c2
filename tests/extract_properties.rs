use qualcode_harness::codebook::{Category, Codebook};
use qualcode_harness::extract::{extract_code, extract_with_codebook, ExtractionOutcome};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// No ASCII digits, but includes dots, whitespace and non-ASCII text.
const NOISE: &[char] = &[
    'a', 'b', 'Z', ' ', '.', ',', '\n', '\t', ':', '-', '(', ')', 'é', 'ß', '\u{0661}', '?',
];

fn noise(rng: &mut StdRng, max_len: usize) -> String {
    let len = rng.gen_range(0..=max_len);
    (0..len).map(|_| NOISE[rng.gen_range(0..NOISE.len())]).collect()
}

fn nonempty_noise(rng: &mut StdRng, max_len: usize) -> String {
    let mut s = noise(rng, max_len);
    if s.is_empty() {
        s.push(' ');
    }
    s
}

fn random_code(rng: &mut StdRng) -> Category {
    Category::new(rng.gen_range(0..10), rng.gen_range(0..10)).unwrap()
}

#[test]
fn digitless_text_is_always_uncodable() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..500 {
        let text = noise(&mut rng, 80);
        assert_eq!(extract_code(&text), Category::UNCODABLE, "text: {text:?}");
    }
}

#[test]
fn single_code_is_returned_verbatim() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..500 {
        let code = random_code(&mut rng);
        let text = format!("{}{}{}", noise(&mut rng, 40), code, noise(&mut rng, 40));
        assert_eq!(extract_code(&text), code, "text: {text:?}");
        assert_eq!(extract_code(&text).to_string(), code.to_string());
    }
}

#[test]
fn left_most_of_several_codes_wins() {
    let mut rng = StdRng::seed_from_u64(13);
    for _ in 0..500 {
        let first = random_code(&mut rng);
        let second = random_code(&mut rng);
        let text = format!(
            "{}{}{}{}{}",
            noise(&mut rng, 20),
            first,
            nonempty_noise(&mut rng, 20),
            second,
            noise(&mut rng, 20)
        );
        assert_eq!(extract_code(&text), first, "text: {text:?}");
    }
}

#[test]
fn validated_extraction_always_returns_a_codebook_member() {
    let codebook = Codebook::trust_framework();
    let mut rng = StdRng::seed_from_u64(17);
    for _ in 0..500 {
        let code = random_code(&mut rng);
        let text = format!("{}{}{}", noise(&mut rng, 30), code, noise(&mut rng, 30));
        let ex = extract_with_codebook(&text, &codebook);
        assert!(codebook.contains(ex.category));
        assert_eq!(ex.found, Some(code));
        if codebook.contains(code) {
            assert_eq!(ex.outcome, ExtractionOutcome::Matched);
            assert_eq!(ex.category, code);
        } else {
            assert_eq!(ex.outcome, ExtractionOutcome::OutOfCodebook);
            assert_eq!(ex.category, Category::UNCODABLE);
        }
    }
}

#[test]
fn adjacent_digits_do_not_extend_the_match() {
    assert_eq!(extract_code("12.34").to_string(), "2.3");
    assert_eq!(extract_code("1.23.4").to_string(), "1.2");
    assert_eq!(extract_code("v10.0 then 3.1").to_string(), "0.0");
    assert_eq!(extract_code(". 1 . 2 .").to_string(), "0.0");
}
