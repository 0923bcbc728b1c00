use rand::Rng;

const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TOKEN_LEN: usize = 11;

/// Returns true for identifiers of the form `word([ _-]word)*` where every
/// word is ASCII alphanumeric. Empty ids are rejected.
pub fn validate_id(id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    let mut previous_was_separator = true;
    for ch in id.chars() {
        if ch.is_ascii_alphanumeric() {
            previous_was_separator = false;
        } else if matches!(ch, ' ' | '_' | '-') {
            if previous_was_separator {
                return false;
            }
            previous_was_separator = true;
        } else {
            return false;
        }
    }
    !previous_was_separator
}

/// Random base-36 token used for auth tokens and connection ids.
pub fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

pub(crate) fn connection_id(prefix: &str) -> String {
    format!("{prefix}{}", random_token())
}
