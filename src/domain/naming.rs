//! Default table names: pluralized snake_case of the type's simple name.

/// Derive a table name from a (possibly fully qualified, possibly generic)
/// Rust type name.
pub fn table_name_for(type_name: &str) -> String {
    let without_generics = type_name.split('<').next().unwrap_or(type_name);
    let simple = without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics);
    pluralize(&snake_case(simple))
}

pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (idx, ch) in chars.iter().enumerate() {
        if ch.is_uppercase() {
            let prev_lower = idx > 0 && (chars[idx - 1].is_lowercase() || chars[idx - 1].is_ascii_digit());
            let acronym_end = idx > 0
                && chars[idx - 1].is_uppercase()
                && chars.get(idx + 1).is_some_and(|next| next.is_lowercase());
            if prev_lower || acronym_end {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(*ch);
        }
    }
    out
}

pub fn pluralize(word: &str) -> String {
    const SIBILANT_SUFFIXES: [&str; 5] = ["s", "x", "z", "ch", "sh"];

    if let Some(stem) = word.strip_suffix('y')
        && !stem.ends_with(['a', 'e', 'i', 'o', 'u'])
        && !stem.is_empty()
    {
        return format!("{stem}ies");
    }
    if SIBILANT_SUFFIXES.iter().any(|suffix| word.ends_with(suffix)) {
        return format!("{word}es");
    }
    format!("{word}s")
}
