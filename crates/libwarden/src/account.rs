//! Helpers for Windows-style `DOMAIN\user` account names.

/// Split an account at the first backslash into `(domain, user)`.
pub fn split_account(account: &str) -> (Option<&str>, &str) {
    match account.split_once('\\') {
        Some((domain, user)) => (Some(domain), user),
        None => (None, account),
    }
}

/// Whether two account names can refer to the same user.
///
/// A bare name matches any domain, so `alice` matches `CORP\alice`. Two
/// qualified names match only when the domains are equal as well.
pub fn same_account(a: &str, b: &str) -> bool {
    let (domain_a, user_a) = split_account(a);
    let (domain_b, user_b) = split_account(b);
    if user_a != user_b {
        return false;
    }
    match (domain_a, domain_b) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

/// Account name of the current process owner, `DOMAIN\user` when a domain is known.
pub fn current_username() -> Option<String> {
    let user = std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .ok()
        .filter(|u| !u.is_empty())?;
    match std::env::var("USERDOMAIN") {
        Ok(domain) if !domain.is_empty() && !user.contains('\\') => {
            Some(format!("{domain}\\{user}"))
        }
        _ => Some(user),
    }
}
