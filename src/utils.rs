/// Adds `https://` unless the input already names a scheme, so emulator
/// endpoints can opt into plain http.
pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_explicit_scheme() {
        assert_eq!(normalize_url(" http://localhost:8080 "), "http://localhost:8080");
        assert_eq!(normalize_url("firestore.googleapis.com"), "https://firestore.googleapis.com");
    }

    #[test]
    fn whitespace_is_blank() {
        assert!(is_blank(""));
        assert!(is_blank(" \t\n"));
        assert!(!is_blank(" hi "));
    }
}
