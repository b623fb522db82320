//! Input format checks used by the sign-up flow and the demo seeding.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

// Optional leading +, then 10 to 15 ASCII digits, spaces or hyphens
static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[0-9\s-]{10,15}$").unwrap());

// One @, no whitespace, at least one dot after the @
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 30;

pub fn validate_phone(phone: &str) -> bool {
    PHONE_RE.is_match(phone)
}

pub fn validate_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

// Lengths are counted in UTF-16 code units, as browsers count them
fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

pub fn validate_password(password: &str) -> bool {
    utf16_len(password) >= MIN_PASSWORD_LEN
}

pub fn validate_username(username: &str) -> bool {
    (MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&utf16_len(username))
}

/// Placeholder US-shaped phone number, e.g. `+1 415-555-0123`
pub fn generate_random_phone() -> String {
    let mut rng = rand::thread_rng();
    let area_code: u32 = rng.gen_range(100..1000);
    let prefix: u32 = rng.gen_range(100..1000);
    let line_number: u32 = rng.gen_range(1000..10000);
    format!("+1 {}-{}-{}", area_code, prefix, line_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phone_accepts_common_shapes() {
        assert!(validate_phone("4155550123"));
        assert!(validate_phone("+14155550123"));
        assert!(validate_phone("+1 415-555-0123"));
        assert!(validate_phone("415 555 0123"));
        assert!(validate_phone("123456789012345"));
    }

    #[test]
    fn test_phone_rejects_letters_and_bad_lengths() {
        assert!(!validate_phone("415555012"));
        assert!(!validate_phone("1234567890123456"));
        assert!(!validate_phone("415-555-CALL"));
        assert!(!validate_phone("(415) 555-0123"));
        assert!(!validate_phone("++4155550123"));
        assert!(!validate_phone(""));
        // Arabic-Indic digits are not phone digits
        assert!(!validate_phone("١٢٣٤٥٦٧٨٩٠"));
        assert!(!validate_phone("+١ ٤١٥-٥٥٥-٠١٢٣"));
    }

    #[test]
    fn test_email() {
        assert!(validate_email("alice@example.com"));
        assert!(validate_email("a.b+tag@mail.example.org"));
        assert!(!validate_email("alice@example"));
        assert!(!validate_email("alice example@example.com"));
        assert!(!validate_email("alice@@example.com"));
        assert!(!validate_email("@example.com"));
        assert!(!validate_email("alice@.com"));
    }

    #[test]
    fn test_password_length() {
        assert!(!validate_password(""));
        assert!(!validate_password("12345"));
        assert!(validate_password("123456"));
        assert!(validate_password("a much longer passphrase"));
        // Each emoji is a surrogate pair
        assert!(validate_password("ab😀😀"));
        assert!(!validate_password("ab😀"));
    }

    #[test]
    fn test_username_bounds() {
        assert!(!validate_username("ab"));
        assert!(validate_username("abc"));
        assert!(validate_username(&"x".repeat(30)));
        assert!(!validate_username(&"x".repeat(31)));
        assert!(validate_username("😀😀"));
        assert!(!validate_username(&"😀".repeat(16)));
    }

    #[test]
    fn test_generated_phone_is_valid() {
        for _ in 0..50 {
            let phone = generate_random_phone();
            assert!(phone.starts_with("+1 "), "unexpected prefix in {}", phone);
            assert!(validate_phone(&phone), "generated phone {} failed validation", phone);
        }
    }
}
