//! Host layout configuration for the step executor.

use std::path::PathBuf;

use workflow::AppKind;

/// Filesystem layout and service accounts the executor provisions against.
///
/// Reads from environment variables, falling back to the conventional
/// Debian/Apache layout:
/// - `WEB_ROOT` — document roots live under this directory (default `/var/www`)
/// - `VHOST_DIR` — virtual-host configs (default `/etc/apache2/sites-available`)
/// - `MAIL_ROOT` — maildirs (default `/var/mail`)
/// - `SCRATCH_DIR` — download scratch space (default `/tmp`)
/// - `POSTFIX_VIRTUAL_FILE` — postfix virtual map (default `/etc/postfix/virtual_users`)
/// - `DOVECOT_USERS_FILE` — dovecot passwd file (default `/etc/dovecot/users`)
/// - `WEB_USER` — web server account owning site files (default `www-data`)
/// - `MAIL_USER` — mail account owning maildirs (default `mail`)
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub web_root: PathBuf,
    pub vhost_dir: PathBuf,
    pub mail_root: PathBuf,
    pub scratch_dir: PathBuf,
    pub postfix_virtual_file: PathBuf,
    pub dovecot_users_file: PathBuf,
    pub web_user: String,
    pub mail_user: String,
}

impl ExecutorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            web_root: path_var("WEB_ROOT").unwrap_or(defaults.web_root),
            vhost_dir: path_var("VHOST_DIR").unwrap_or(defaults.vhost_dir),
            mail_root: path_var("MAIL_ROOT").unwrap_or(defaults.mail_root),
            scratch_dir: path_var("SCRATCH_DIR").unwrap_or(defaults.scratch_dir),
            postfix_virtual_file: path_var("POSTFIX_VIRTUAL_FILE")
                .unwrap_or(defaults.postfix_virtual_file),
            dovecot_users_file: path_var("DOVECOT_USERS_FILE")
                .unwrap_or(defaults.dovecot_users_file),
            web_user: std::env::var("WEB_USER").unwrap_or(defaults.web_user),
            mail_user: std::env::var("MAIL_USER").unwrap_or(defaults.mail_user),
        }
    }

    /// Returns the document root for a domain.
    pub fn document_root(&self, domain: &str) -> PathBuf {
        self.web_root.join(domain)
    }

    /// Returns the virtual-host config path for a domain.
    pub fn vhost_config(&self, domain: &str) -> PathBuf {
        self.vhost_dir.join(format!("{domain}.conf"))
    }

    /// Returns the maildir for an account.
    pub fn maildir(&self, domain: &str, user: &str) -> PathBuf {
        self.mail_root.join(domain).join(user)
    }

    /// Returns the scratch path for an application release archive.
    pub fn archive_path(&self, app: AppKind) -> PathBuf {
        self.scratch_dir.join(app.archive_name())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            web_root: PathBuf::from("/var/www"),
            vhost_dir: PathBuf::from("/etc/apache2/sites-available"),
            mail_root: PathBuf::from("/var/mail"),
            scratch_dir: PathBuf::from("/tmp"),
            postfix_virtual_file: PathBuf::from("/etc/postfix/virtual_users"),
            dovecot_users_file: PathBuf::from("/etc/dovecot/users"),
            web_user: "www-data".to_string(),
            mail_user: "mail".to_string(),
        }
    }
}

fn path_var(name: &str) -> Option<PathBuf> {
    std::env::var(name).ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout() {
        let config = ExecutorConfig::default();
        assert_eq!(
            config.document_root("example.com"),
            PathBuf::from("/var/www/example.com")
        );
        assert_eq!(
            config.vhost_config("example.com"),
            PathBuf::from("/etc/apache2/sites-available/example.com.conf")
        );
        assert_eq!(
            config.maildir("example.com", "user"),
            PathBuf::from("/var/mail/example.com/user")
        );
    }

    #[test]
    fn archive_paths_are_per_app() {
        let config = ExecutorConfig::default();
        assert_eq!(
            config.archive_path(AppKind::WordPress),
            PathBuf::from("/tmp/wordpress-latest.tar.gz")
        );
        assert_ne!(
            config.archive_path(AppKind::Joomla),
            config.archive_path(AppKind::Drupal)
        );
    }
}
