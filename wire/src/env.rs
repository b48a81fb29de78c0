//! `KEY=VALUE` environment list helpers, shared by the wire import/export path and the daemon's
//! child-environment composition.

/// Sets `KEY=VALUE` in `env`, removing any existing entry for `key` first.
///
/// A duplicate-key envp handed to `execve` is ambiguous in practice — glibc's `getenv` returns the
/// first match, while this module's own [`get`] (and a shell's `export`-driven view) returns the
/// last — so the only representation that means the same thing to every consumer is one with no
/// duplicates. That matters here specifically: `compose_environment` calls this to inject
/// `HOME`/`USER` after any request-supplied extras, and that injection has to actually win.
pub fn add(env: &mut Vec<String>, key: &str, value: &str) {
    env.retain(|entry| split(entry).map(|(k, _)| k != key).unwrap_or(true));
    env.push(format!("{key}={value}"));
}

/// Returns the value of the entry in `env` whose key matches, or `None` if absent. Since `add`
/// never leaves more than one entry per key, there is at most one to find.
pub fn get<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter()
        .rev()
        .find_map(|entry| split(entry).filter(|(k, _)| *k == key).map(|(_, v)| v))
}

fn split(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let mut env = Vec::new();
        add(&mut env, "PATH", "/bin");
        assert_eq!(get(&env, "PATH"), Some("/bin"));
    }

    #[test]
    fn re_adding_replaces_the_existing_entry() {
        let mut env = Vec::new();
        add(&mut env, "X", "1");
        add(&mut env, "X", "2");
        assert_eq!(env, vec!["X=2".to_string()]);
        assert_eq!(get(&env, "X"), Some("2"));
    }

    #[test]
    fn missing_key_is_none() {
        let env = vec!["A=1".to_string()];
        assert_eq!(get(&env, "B"), None);
    }

    #[test]
    fn get_prefers_the_last_of_duplicate_entries_not_added_via_add() {
        // A client can hand us duplicate keys directly (e.g. two `--env PATH=...` flags end up as
        // two raw entries before anything goes through `add`); `get` must still resolve those as
        // last-one-wins, matching the precedence rule documented for request-supplied `PATH`.
        let env = vec!["PATH=/first".to_string(), "PATH=/second".to_string()];
        assert_eq!(get(&env, "PATH"), Some("/second"));
    }
}
