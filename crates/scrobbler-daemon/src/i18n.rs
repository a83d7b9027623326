//! Message catalog for labels the daemon renders itself (menu items).
//! Placeholders are `$1`, `$2`, ... like the extension `messages.json`.

const CATALOG: &[(&str, &str)] = &[
    ("menuEnableConnector", "Enable $1 connector"),
    ("menuDisableConnector", "Disable $1 connector"),
    ("menuDisableUntilTabClosed", "Disable connector until tab is closed"),
];

/// Look up `key` and substitute placeholders.  Unknown keys come back as-is.
pub fn message(key: &str, substitutions: &[&str]) -> String {
    let Some((_, template)) = CATALOG.iter().find(|(k, _)| *k == key) else {
        return key.to_string();
    };

    let mut text = template.to_string();
    // Highest index first so $1 does not eat the prefix of $10.
    for (idx, value) in substitutions.iter().enumerate().rev() {
        text = text.replace(&format!("${}", idx + 1), value);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitution() {
        assert_eq!(
            message("menuDisableConnector", &["SoundCloud"]),
            "Disable SoundCloud connector"
        );
    }

    #[test]
    fn test_unknown_key_is_returned() {
        assert_eq!(message("menuMissing", &["x"]), "menuMissing");
    }
}
