//! Format checks that can run before anything touches the vault: password
//! strength scoring and per-provider API key shape validation (§4.10).
//! Neither of these talks to storage — they're pure functions over the
//! strings the caller is about to hand to [`crate::coordinator::Coordinator`].

use std::sync::OnceLock;

use regex::Regex;

/// A coarse password strength bucket, derived from [`score_password`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PasswordStrength {
	Weak,
	Fair,
	Good,
	Strong,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PasswordStrengthReport {
	/// 0-100.
	pub score: u8,
	pub strength: PasswordStrength,
	/// Every requirement the password currently fails, in a form suitable
	/// for surfacing directly as [`crate::errors::CoordinatorError::InvalidPassword`]'s
	/// aggregated list.
	pub failing_requirements: Vec<String>,
	pub entropy_bits: u32,
}

impl PasswordStrengthReport {
	pub fn meets_requirements(&self) -> bool {
		self.failing_requirements.is_empty()
	}
}

pub const MIN_PASSWORD_LENGTH: usize = 12;
pub const MAX_PASSWORD_LENGTH: usize = 128;
const MIN_CHARACTER_CLASSES: u32 = 3;

/// Normalized (lowercase, non-alphanumerics stripped) list of common/banned
/// passwords. Small and illustrative rather than exhaustive — a production
/// deployment would load this from a larger compiled wordlist, but the
/// matching rule (normalize, then exact match) is what matters here.
const BANNED_PASSWORDS: &[&str] = &[
	"password",
	"password123",
	"123456",
	"123456789",
	"12345678",
	"qwerty",
	"qwerty123",
	"letmein",
	"welcome",
	"welcome123",
	"admin",
	"administrator",
	"iloveyou",
	"monkey",
	"dragon",
	"football",
	"baseball",
	"trustno1",
	"sunshine",
	"princess",
	"master",
	"superman",
	"whatever",
	"changeme",
	"passw0rd",
	"p@ssw0rd",
	"letmein123",
	"abc123",
];

/// Runs of 4+ characters anywhere in these sequences (forwards or backwards)
/// are penalized: alphabet, digits, and the three home rows of a QWERTY
/// keyboard.
const SEQUENTIAL_ALPHABETS: &[&str] = &["abcdefghijklmnopqrstuvwxyz", "0123456789", "qwertyuiop", "asdfghjkl", "zxcvbnm"];

fn normalize_for_banlist(password: &str) -> String {
	password.to_lowercase().chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// True if any 4+ run of identical characters appears in `password`.
fn has_consecutive_repeat(password: &str) -> bool {
	let chars: Vec<char> = password.chars().collect();
	chars.windows(4).any(|w| w[0] == w[1] && w[1] == w[2] && w[2] == w[3])
}

/// Counts 4-character substrings of `password` that appear (forwards or
/// backwards) in one of [`SEQUENTIAL_ALPHABETS`] — "abcd", "6789", "qwer",
/// and their reverses all count.
fn sequential_substring_count(password: &str) -> usize {
	let lower: Vec<char> = password.to_lowercase().chars().collect();
	if lower.len() < 4 {
		return 0;
	}

	let mut hits = 0;
	for window in lower.windows(4) {
		let forward: String = window.iter().collect();
		let backward: String = window.iter().rev().collect();
		let is_sequential = SEQUENTIAL_ALPHABETS.iter().any(|seq| seq.contains(&forward) || seq.contains(&backward));
		if is_sequential {
			hits += 1;
		}
	}
	hits
}

fn character_classes(password: &str) -> (bool, bool, bool, bool) {
	let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
	let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
	let has_digit = password.chars().any(|c| c.is_ascii_digit());
	let has_special = password.chars().any(|c| !c.is_ascii_alphanumeric());
	(has_lower, has_upper, has_digit, has_special)
}

/// `floor(length * log2(active charset size))`, where the active charset
/// sums the sizes of every character class actually observed in `password`
/// (lowercase=26, uppercase=26, digit=10, special=32).
pub fn estimate_entropy_bits(password: &str) -> u32 {
	let length = password.chars().count();
	if length == 0 {
		return 0;
	}

	let (has_lower, has_upper, has_digit, has_special) = character_classes(password);
	let mut charset_size: u32 = 0;
	if has_lower {
		charset_size += 26;
	}
	if has_upper {
		charset_size += 26;
	}
	if has_digit {
		charset_size += 10;
	}
	if has_special {
		charset_size += 32;
	}
	if charset_size == 0 {
		return 0;
	}

	(length as f64 * (charset_size as f64).log2()).floor() as u32
}

/// Scores `password` on a 0-100 scale, buckets it into a [`PasswordStrength`],
/// and lists every hard requirement it currently fails (§4.10). A password
/// with a non-empty `failing_requirements` must be rejected by
/// [`crate::coordinator::Coordinator`]; the sequential-substring penalty
/// affects only the score, never rejection.
pub fn score_password(password: &str) -> PasswordStrengthReport {
	let mut failing_requirements = Vec::new();
	let length = password.chars().count();

	if length < MIN_PASSWORD_LENGTH {
		failing_requirements.push(format!("Use at least {MIN_PASSWORD_LENGTH} characters."));
	}
	if length > MAX_PASSWORD_LENGTH {
		failing_requirements.push(format!("Use at most {MAX_PASSWORD_LENGTH} characters."));
	}

	let (has_lower, has_upper, has_digit, has_special) = character_classes(password);
	let class_count = [has_lower, has_upper, has_digit, has_special].iter().filter(|present| **present).count() as u32;
	if class_count < MIN_CHARACTER_CLASSES {
		failing_requirements.push("Use at least 3 of: uppercase, lowercase, digits, symbols.".to_string());
	}

	if BANNED_PASSWORDS.contains(&normalize_for_banlist(password).as_str()) {
		failing_requirements.push("This password is too common.".to_string());
	}

	if has_consecutive_repeat(password) {
		failing_requirements.push("Avoid 4 or more repeated characters in a row.".to_string());
	}

	let sequential_hits = sequential_substring_count(password);

	let entropy_bits = estimate_entropy_bits(password);
	// 80 bits of entropy maps to a full entropy contribution; short passwords
	// are capped regardless of charset variety.
	let mut score = ((entropy_bits as f64 / 80.0) * 100.0).clamp(0.0, 100.0);
	score += 5.0 * class_count as f64;
	score -= 10.0 * sequential_hits as f64;
	if length < MIN_PASSWORD_LENGTH {
		score = score.min(29.0);
	}
	if !failing_requirements.is_empty() {
		score = score.min(49.0);
	}
	let score = score.clamp(0.0, 100.0) as u8;

	let strength = match score {
		0..=29 => PasswordStrength::Weak,
		30..=49 => PasswordStrength::Fair,
		50..=69 => PasswordStrength::Good,
		_ => PasswordStrength::Strong,
	};

	PasswordStrengthReport {
		score,
		strength,
		failing_requirements,
		entropy_bits,
	}
}

/// One provider's API key shape: a regex to match the whole (trimmed) key,
/// plus the hint and example shown when validation fails.
pub struct ProviderKeyFormat {
	pub provider: &'static str,
	pub display_name: &'static str,
	pub pattern: &'static str,
	pub hint: &'static str,
	pub example: &'static str,
}

pub const PROVIDER_KEY_FORMATS: &[ProviderKeyFormat] = &[
	ProviderKeyFormat {
		provider: "openai",
		display_name: "OpenAI",
		pattern: r"^sk-[A-Za-z0-9_-]{20,251}$",
		hint: "OpenAI keys start with \"sk-\" and are at least 23 characters long.",
		example: "sk-proj-abc123def456ghi789jkl",
	},
	ProviderKeyFormat {
		provider: "anthropic",
		display_name: "Anthropic",
		pattern: r"^sk-ant-[A-Za-z0-9_-]{20,245}$",
		hint: "Anthropic keys start with \"sk-ant-\" and are at least 27 characters long.",
		example: "sk-ant-REDACTED",
	},
	ProviderKeyFormat {
		provider: "google",
		display_name: "Google",
		pattern: r"^AIza[A-Za-z0-9_-]{20,252}$",
		hint: "Google API keys start with \"AIza\".",
		example: "AIzaSyAbc123Def456Ghi789Jkl012Mno345",
	},
	ProviderKeyFormat {
		provider: "cohere",
		display_name: "Cohere",
		pattern: r"^[A-Za-z0-9]{30,256}$",
		hint: "Cohere keys are at least 30 alphanumeric characters.",
		example: "abc123def456ghi789jkl012mno345pqr",
	},
];

/// Minimum/maximum length the length-only fallback accepts for a provider
/// with no entry in [`PROVIDER_KEY_FORMATS`] (§4.10).
const UNKNOWN_PROVIDER_MIN_LENGTH: usize = 16;
const UNKNOWN_PROVIDER_MAX_LENGTH: usize = 256;

/// Looks up the format rule for `provider`, case-insensitively.
pub fn format_for_provider(provider: &str) -> Option<&'static ProviderKeyFormat> {
	PROVIDER_KEY_FORMATS.iter().find(|f| f.provider.eq_ignore_ascii_case(provider))
}

fn compiled_pattern(format: &ProviderKeyFormat) -> &'static Regex {
	// One `OnceLock` slot per table entry, indexed by provider name, avoids
	// recompiling the same regex on every call — the same lazy-static-regex
	// idiom `ah-credentials::validation` uses for its account-name pattern.
	static CACHE: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
	let cache = CACHE.get_or_init(|| {
		PROVIDER_KEY_FORMATS
			.iter()
			.map(|f| (f.provider, Regex::new(f.pattern).expect("provider key pattern is valid")))
			.collect()
	});
	&cache.iter().find(|(name, _)| *name == format.provider).expect("format came from PROVIDER_KEY_FORMATS").1
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiKeyValidation {
	pub sanitized_key: String,
}

/// Validates `key` against `provider`'s known shape. Trims surrounding
/// whitespace first; rejects empty keys or keys containing internal
/// whitespace. Providers with no known format fall back to a plain length
/// check (§4.10) — format checking is a courtesy for providers this crate
/// recognizes, not a gate on providers it doesn't.
pub fn validate_api_key_format(provider: &str, key: &str) -> Result<ApiKeyValidation, String> {
	let trimmed = key.trim();
	if trimmed.is_empty() {
		return Err("API key must not be empty.".to_string());
	}
	if trimmed.chars().any(char::is_whitespace) {
		return Err("API key must not contain whitespace.".to_string());
	}

	match format_for_provider(provider) {
		Some(format) => {
			if compiled_pattern(format).is_match(trimmed) {
				Ok(ApiKeyValidation {
					sanitized_key: trimmed.to_string(),
				})
			} else {
				Err(format!("Invalid {} API key format. {}", format.display_name, format.hint))
			}
		}
		None => {
			if (UNKNOWN_PROVIDER_MIN_LENGTH..=UNKNOWN_PROVIDER_MAX_LENGTH).contains(&trimmed.len()) {
				Ok(ApiKeyValidation {
					sanitized_key: trimmed.to_string(),
				})
			} else {
				Err(format!(
					"API key must be between {UNKNOWN_PROVIDER_MIN_LENGTH} and {UNKNOWN_PROVIDER_MAX_LENGTH} characters."
				))
			}
		}
	}
}

/// Masks `key` for display: the first 6 and last 4 characters survive,
/// joined by 8 literal `*`s. Keys of 12 characters or fewer are replaced
/// entirely by stars of their own length, since there isn't enough material
/// to safely show any of it (§4.10).
pub fn mask_key(key: &str) -> String {
	let chars: Vec<char> = key.chars().collect();
	if chars.len() <= 12 {
		return "*".repeat(chars.len());
	}
	let head: String = chars[..6].iter().collect();
	let tail: String = chars[chars.len() - 4..].iter().collect();
	format!("{head}{stars}{tail}", stars = "*".repeat(8))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_password_is_weakest() {
		let report = score_password("");
		assert_eq!(report.strength, PasswordStrength::Weak);
		assert_eq!(report.score, 0);
		assert!(!report.meets_requirements());
	}

	#[test]
	fn short_password_fails_length_requirement() {
		let report = score_password("Aa1!Aa1!");
		assert!(report.failing_requirements.iter().any(|f| f.contains("12 characters")));
	}

	#[test]
	fn long_varied_password_scores_strong_and_meets_requirements() {
		let report = score_password("Tr0ub4dor&3xtraLongPassphrase!!");
		assert_eq!(report.strength, PasswordStrength::Strong);
		assert!(report.meets_requirements());
	}

	#[test]
	fn exactly_twelve_characters_with_three_classes_meets_requirements() {
		let report = score_password("Sn0wman1Cave");
		assert!(report.meets_requirements());
	}

	#[test]
	fn fewer_than_three_character_classes_fails() {
		let report = score_password("alllowercaseletters");
		assert!(report.failing_requirements.iter().any(|f| f.contains("3 of")));
	}

	#[test]
	fn banned_password_fails_even_if_long() {
		let report = score_password("Password123!!!!");
		assert!(report.failing_requirements.iter().any(|f| f.contains("common")));
	}

	#[test]
	fn four_repeated_characters_fails() {
		let report = score_password("Str0ngggg!Pass");
		assert!(report.failing_requirements.iter().any(|f| f.contains("repeated")));
	}

	#[test]
	fn sequential_run_lowers_score_but_does_not_reject() {
		let with_sequence = score_password("abcdStrongPass1!");
		let without_sequence = score_password("qzxvStrongPass1!");
		assert!(with_sequence.meets_requirements());
		assert!(with_sequence.score < without_sequence.score);
	}

	#[test]
	fn entropy_grows_with_length_and_charset() {
		assert!(estimate_entropy_bits("aaaaaaaaaaaa") < estimate_entropy_bits("aB3!aB3!aB3!"));
	}

	#[test]
	fn openai_key_format_accepts_the_spec_example() {
		let result = validate_api_key_format("openai", "sk-proj-abc123def456ghi789jkl").unwrap();
		assert_eq!(result.sanitized_key, "sk-proj-abc123def456ghi789jkl");
	}

	#[test]
	fn openai_key_format_trims_surrounding_whitespace() {
		let result = validate_api_key_format("openai", "  sk-proj-abc123def456ghi789jkl  ").unwrap();
		assert_eq!(result.sanitized_key, "sk-proj-abc123def456ghi789jkl");
	}

	#[test]
	fn openai_key_format_rejects_garbage_with_the_expected_hint() {
		let err = validate_api_key_format("openai", "invalid-key-format").unwrap_err();
		assert!(err.contains("Invalid OpenAI API key format"));
	}

	#[test]
	fn unknown_provider_falls_back_to_length_check() {
		assert!(validate_api_key_format("some-future-provider", "0123456789abcdef").is_ok());
		assert!(validate_api_key_format("some-future-provider", "too-short").is_err());
	}

	#[test]
	fn empty_key_is_rejected_for_every_provider() {
		assert!(validate_api_key_format("openai", "").is_err());
		assert!(validate_api_key_format("some-future-provider", "   ").is_err());
	}

	#[test]
	fn mask_key_shows_only_the_edges() {
		assert_eq!(mask_key("sk-proj-abc123def456ghi789jkl"), "sk-pro********789jkl");
		assert_eq!(mask_key("short-key"), "*********");
	}
}
