//! Verification of the internal account's grants.

use xfront_core::{Error, Result};

/// Account the front-end runs its internal statements as.
pub const INTERNAL_ACCOUNT: &str = "`xfront.session`@`localhost`";

/// Check the `SHOW GRANTS` output of [`INTERNAL_ACCOUNT`].
///
/// The account needs `SELECT` on the user table (or on everything) and
/// `SUPER` globally. An account holding nothing beyond `USAGE`, or only a
/// partial set of what the front-end itself grants, is reported as
/// [`Error::MissingPermissions`] so the grants can be reapplied. Anything else
/// means someone customised the account and is [`Error::BadConfiguration`].
///
/// # Errors
/// As described above.
pub fn verify_account_grants<S: AsRef<str>>(grants: &[S]) -> Result<()> {
    let mut has_no_privileges = false;
    let mut has_select = false;
    let mut has_super = false;

    for grant in grants {
        let grant = grant.as_ref();
        if grant.starts_with("GRANT USAGE ON *.* TO ") {
            has_no_privileges = true;
            continue;
        }

        let (privileges, on_all) = if let Some(pos) = grant.find(" ON *.*") {
            (&grant[..pos], true)
        } else if let Some(pos) =
            grant.find(" ON `mysql`.*").or_else(|| grant.find(" ON `mysql`.`user`"))
        {
            (&grant[..pos], false)
        } else {
            continue;
        };
        let privileges = format!("{privileges} ");

        if privileges.contains(" ALL ") {
            has_select = true;
            has_super |= on_all;
        }
        if privileges.contains(" SELECT ") || privileges.contains(" SELECT,") {
            has_select = true;
        }
        if privileges.contains(" SUPER ") || privileges.contains(" SUPER,") {
            has_super = true;
        }
    }

    if has_select && has_super {
        return Ok(());
    }

    let count = grants.len();
    if has_no_privileges && (count == 1 || (count == 2 && has_select)) {
        return Err(Error::MissingPermissions {
            message: format!("{INTERNAL_ACCOUNT} lacks the grants it needs"),
        });
    }

    Err(Error::BadConfiguration {
        message: format!("{INTERNAL_ACCOUNT} carries unexpected grants"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_and_super_on_all() {
        assert!(verify_account_grants(&["GRANT SELECT, SUPER ON *.* TO `u`@`h`"]).is_ok());
    }

    #[test]
    fn test_all_privileges_on_all() {
        assert!(verify_account_grants(&["GRANT ALL PRIVILEGES ON *.* TO `u`@`h`"]).is_ok());
    }

    #[test]
    fn test_split_grants() {
        let grants = ["GRANT SUPER ON *.* TO `u`@`h`", "GRANT SELECT ON `mysql`.`user` TO `u`@`h`"];
        assert!(verify_account_grants(&grants).is_ok());
    }

    #[test]
    fn test_usage_only_is_missing_permissions() {
        let result = verify_account_grants(&["GRANT USAGE ON *.* TO `u`@`h`"]);
        assert!(matches!(result, Err(Error::MissingPermissions { .. })));
    }

    #[test]
    fn test_usage_and_select_is_missing_permissions() {
        let grants =
            ["GRANT USAGE ON *.* TO `u`@`h`", "GRANT SELECT ON `mysql`.`user` TO `u`@`h`"];
        assert!(matches!(verify_account_grants(&grants), Err(Error::MissingPermissions { .. })));
    }

    #[test]
    fn test_custom_grants_are_bad_configuration() {
        let grants = ["GRANT USAGE ON *.* TO `u`@`h`", "GRANT INSERT ON `app`.* TO `u`@`h`"];
        assert!(matches!(verify_account_grants(&grants), Err(Error::BadConfiguration { .. })));
    }

    #[test]
    fn test_all_on_mysql_schema_lacks_super() {
        let grants = ["GRANT ALL PRIVILEGES ON `mysql`.* TO `u`@`h`"];
        assert!(matches!(verify_account_grants(&grants), Err(Error::BadConfiguration { .. })));
    }
}
