//! Provisioning operations and their request contracts.

use std::collections::BTreeMap;

use common::OperationKey;
use ledger::ResourceKind;

use crate::definition::Precondition;
use crate::error::ValidationError;
use crate::params;

/// An installable web application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppKind {
    WordPress,
    Joomla,
    Drupal,
}

impl AppKind {
    /// Returns the application identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::WordPress => "wordpress",
            AppKind::Joomla => "joomla",
            AppKind::Drupal => "drupal",
        }
    }

    /// Parses an application identifier.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wordpress" => Some(AppKind::WordPress),
            "joomla" => Some(AppKind::Joomla),
            "drupal" => Some(AppKind::Drupal),
            _ => None,
        }
    }

    /// URL of the release archive to download.
    pub fn release_url(&self) -> &'static str {
        match self {
            AppKind::WordPress => "https://wordpress.org/latest.tar.gz",
            AppKind::Joomla => {
                "https://downloads.joomla.org/cms/joomla4/4-4-0/Joomla_4-4-0-Stable-Full_Package.tar.gz"
            }
            AppKind::Drupal => "https://ftp.drupal.org/files/projects/drupal-10.1.6.tar.gz",
        }
    }

    /// File name of the downloaded archive in the scratch directory.
    pub fn archive_name(&self) -> &'static str {
        match self {
            AppKind::WordPress => "wordpress-latest.tar.gz",
            AppKind::Joomla => "joomla-4-4-0.tar.gz",
            AppKind::Drupal => "drupal-10.1.6.tar.gz",
        }
    }

    /// Top-level directory inside the release archive.
    pub fn archive_root(&self) -> &'static str {
        match self {
            AppKind::WordPress => "wordpress",
            AppKind::Joomla => "joomla",
            AppKind::Drupal => "drupal-10.1.6",
        }
    }

    /// Config file written into the document root.
    pub fn config_file(&self) -> &'static str {
        match self {
            AppKind::WordPress => "wp-config.php",
            AppKind::Joomla => "configuration.php",
            AppKind::Drupal => "sites/default/settings.php",
        }
    }

    /// Path of the browser-based setup page, relative to the site root.
    pub fn setup_path(&self) -> &'static str {
        match self {
            AppKind::WordPress => "wp-admin/install.php",
            AppKind::Joomla => "installation/",
            AppKind::Drupal => "core/install.php",
        }
    }
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A provisioning operation exposed by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateDomain,
    CreateDatabase,
    InstallApp(AppKind),
    CreateEmailAccount,
    IssueCertificate,
}

impl Operation {
    /// Parses an operation name as it appears in the API path.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "create_domain" => Some(Operation::CreateDomain),
            "create_database" => Some(Operation::CreateDatabase),
            "create_email_account" => Some(Operation::CreateEmailAccount),
            "issue_certificate" => Some(Operation::IssueCertificate),
            _ => name
                .strip_prefix("install_")
                .and_then(AppKind::parse)
                .map(Operation::InstallApp),
        }
    }

    /// Returns the operation name; doubles as the workflow name.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateDomain => "create_domain",
            Operation::CreateDatabase => "create_database",
            Operation::InstallApp(AppKind::WordPress) => "install_wordpress",
            Operation::InstallApp(AppKind::Joomla) => "install_joomla",
            Operation::InstallApp(AppKind::Drupal) => "install_drupal",
            Operation::CreateEmailAccount => "create_email_account",
            Operation::IssueCertificate => "issue_certificate",
        }
    }

    /// Validates the request parameters for this operation.
    ///
    /// Runs before any workflow run is created; a failure here has no side
    /// effects and needs no compensation.
    pub fn validate(&self, params: &BTreeMap<String, String>) -> Result<(), ValidationError> {
        match self {
            Operation::CreateDomain => {
                params::validate_domain(params::require(params, "domain")?)
            }
            Operation::CreateDatabase => {
                params::validate_identifier(params::require(params, "db_name")?)?;
                params::validate_identifier(params::require(params, "db_user")?)
            }
            Operation::InstallApp(_) => {
                params::validate_domain(params::require(params, "domain")?)?;
                params::validate_identifier(params::require(params, "db_name")?)?;
                params::validate_identifier(params::require(params, "db_user")?)
            }
            Operation::CreateEmailAccount => {
                params::validate_email(params::require(params, "email")?)
            }
            Operation::IssueCertificate => {
                params::validate_domain(params::require(params, "domain")?)?;
                params::validate_email(params::require(params, "email")?)
            }
        }
    }

    /// Returns the natural key of the resource this operation targets.
    pub fn natural_key<'a>(
        &self,
        params: &'a BTreeMap<String, String>,
    ) -> Result<&'a str, ValidationError> {
        match self {
            Operation::CreateDomain | Operation::InstallApp(_) | Operation::IssueCertificate => {
                params::require(params, "domain")
            }
            Operation::CreateDatabase => params::require(params, "db_name"),
            Operation::CreateEmailAccount => params::require(params, "email"),
        }
    }

    /// Derives the deduplication key for this request.
    pub fn operation_key(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<OperationKey, ValidationError> {
        let prefix = match self {
            Operation::CreateDomain => "create:domain",
            Operation::CreateDatabase => "create:database",
            Operation::InstallApp(AppKind::WordPress) => "install:wordpress",
            Operation::InstallApp(AppKind::Joomla) => "install:joomla",
            Operation::InstallApp(AppKind::Drupal) => "install:drupal",
            Operation::CreateEmailAccount => "create:email",
            Operation::IssueCertificate => "issue:certificate",
        };
        Ok(OperationKey::derive(prefix, self.natural_key(params)?))
    }

    /// Ledger checks that must hold before the run is admitted.
    pub fn preconditions(&self) -> Vec<Precondition> {
        match self {
            Operation::InstallApp(_) | Operation::IssueCertificate => {
                vec![Precondition::ResourceActive {
                    kind: ResourceKind::Domain,
                    key_param: "domain",
                }]
            }
            _ => Vec::new(),
        }
    }

    /// Slow operations are admitted, spawned, and polled via the run API.
    pub fn is_background(&self) -> bool {
        matches!(self, Operation::InstallApp(_) | Operation::IssueCertificate)
    }

    /// Parameters the engine adds to the request before the run is created,
    /// e.g. the application kind carried by the operation name.
    pub fn implicit_params(&self) -> Vec<(&'static str, &'static str)> {
        match self {
            Operation::InstallApp(app) => vec![("app", app.as_str())],
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_known_operations() {
        assert_eq!(Operation::parse("create_domain"), Some(Operation::CreateDomain));
        assert_eq!(
            Operation::parse("install_wordpress"),
            Some(Operation::InstallApp(AppKind::WordPress))
        );
        assert_eq!(
            Operation::parse("install_drupal"),
            Some(Operation::InstallApp(AppKind::Drupal))
        );
        assert_eq!(Operation::parse("install_rails"), None);
        assert_eq!(Operation::parse("format_disk"), None);
    }

    #[test]
    fn name_roundtrips_through_parse() {
        for op in [
            Operation::CreateDomain,
            Operation::CreateDatabase,
            Operation::InstallApp(AppKind::WordPress),
            Operation::InstallApp(AppKind::Joomla),
            Operation::InstallApp(AppKind::Drupal),
            Operation::CreateEmailAccount,
            Operation::IssueCertificate,
        ] {
            assert_eq!(Operation::parse(op.name()), Some(op));
        }
    }

    #[test]
    fn operation_key_includes_app_and_domain() {
        let p = params(&[("domain", "example.com"), ("db_name", "wp"), ("db_user", "wp")]);
        let key = Operation::InstallApp(AppKind::WordPress)
            .operation_key(&p)
            .unwrap();
        assert_eq!(key.as_str(), "install:wordpress:example.com");
    }

    #[test]
    fn validate_rejects_missing_params() {
        let p = params(&[("domain", "example.com")]);
        let err = Operation::InstallApp(AppKind::WordPress)
            .validate(&p)
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingParam("db_name"));
    }

    #[test]
    fn validate_rejects_bad_domain() {
        let p = params(&[("domain", "bad domain; rm -rf /")]);
        let err = Operation::CreateDomain.validate(&p).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDomain(_)));
    }

    #[test]
    fn validate_accepts_good_requests() {
        let p = params(&[("domain", "example.com"), ("db_name", "wp_example"), ("db_user", "wp_user")]);
        assert!(Operation::InstallApp(AppKind::WordPress).validate(&p).is_ok());

        let p = params(&[("email", "user@example.com")]);
        assert!(Operation::CreateEmailAccount.validate(&p).is_ok());
    }

    #[test]
    fn installs_and_certificates_require_an_existing_domain() {
        assert!(Operation::CreateDomain.preconditions().is_empty());
        assert_eq!(Operation::InstallApp(AppKind::Joomla).preconditions().len(), 1);
        assert_eq!(Operation::IssueCertificate.preconditions().len(), 1);
    }

    #[test]
    fn install_operations_carry_the_app_param() {
        assert_eq!(
            Operation::InstallApp(AppKind::Joomla).implicit_params(),
            vec![("app", "joomla")]
        );
        assert!(Operation::CreateDomain.implicit_params().is_empty());
    }

    #[test]
    fn background_classification() {
        assert!(!Operation::CreateDomain.is_background());
        assert!(!Operation::CreateDatabase.is_background());
        assert!(Operation::InstallApp(AppKind::WordPress).is_background());
        assert!(Operation::IssueCertificate.is_background());
    }
}
