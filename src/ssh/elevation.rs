//! Running commands as another device user
//!
//! Sessions normally log in as `root`; SpringBoard-facing tools such as
//! `uicache` have to run as `mobile`. Rootful jailbreaks ship `su`, rootless
//! ones often only `sudo`, so both are tried.

use super::sanitize::shell_quote;

/// User owning the SpringBoard session on iOS
pub const MOBILE_USER: &str = "mobile";

/// Wrap `command` so it runs as `user`, via `su` or else `sudo -u`.
///
/// # Examples
///
/// ```
/// use isync::ssh::elevation::run_as;
///
/// assert_eq!(
///     run_as("mobile", "uicache"),
///     "(su mobile -c uicache || sudo -u mobile sh -c uicache)"
/// );
/// ```
pub fn run_as(user: &str, command: &str) -> String {
    let user = shell_quote(user);
    let command = shell_quote(command);
    format!(
        "(su {user} -c {command} || sudo -u {user} sh -c {command})",
        user = user,
        command = command
    )
}

/// Like [`run_as`], but `command` is a trusted fragment that must expand
/// variables in the outer shell before switching user (e.g. `"$UC"`).
pub fn run_as_expanding(user: &str, fragment: &str) -> String {
    let user = shell_quote(user);
    format!(
        "(su {user} -c \"{fragment}\" || sudo -u {user} \"{fragment}\")",
        user = user,
        fragment = fragment
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::sanitize::tests::tokenize;

    #[test]
    fn test_run_as_quotes_command() {
        let wrapped = run_as(MOBILE_USER, "killall SpringBoard");
        assert_eq!(
            wrapped,
            "(su mobile -c 'killall SpringBoard' || sudo -u mobile sh -c 'killall SpringBoard')"
        );
    }

    #[test]
    fn test_run_as_su_argument_survives_tokenizing() {
        let wrapped = run_as(MOBILE_USER, "echo 'hi there'");
        let inner = wrapped.trim_start_matches('(').trim_end_matches(')');
        let words = tokenize(inner);
        assert_eq!(&words[..4], &["su", "mobile", "-c", "echo 'hi there'"]);
    }

    #[test]
    fn test_run_as_expanding_keeps_variable() {
        assert_eq!(
            run_as_expanding(MOBILE_USER, "$UC"),
            "(su mobile -c \"$UC\" || sudo -u mobile \"$UC\")"
        );
    }
}
