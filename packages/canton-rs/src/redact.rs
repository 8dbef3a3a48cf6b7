//! Secret redaction for sensitive data in logs, serialization, and display.
//!
//! Use [`Redacted`] to wrap values that must never appear in logs, error
//! messages, or serialized output (private keys, signatures, bearer tokens,
//! database URLs). The wrapped value is never exposed through `Debug`,
//! `Display`, or `Serialize`; every rendering is `"<redacted>"`.

use std::fmt::{self, Debug, Display};

/// Wrapper that redacts its inner value when formatted or serialized.
#[derive(Clone, Copy)]
pub struct Redacted<T>(pub T);

impl<T> Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> serde::Serialize for Redacted<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        "<redacted>".serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_leaks_inner_value() {
        let secret = Redacted("0xdeadbeef-private-key");
        assert_eq!(format!("{}", secret), "<redacted>");
        assert_eq!(format!("{:?}", secret), "<redacted>");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"<redacted>\"");
    }
}
