//! The step executor: interprets workflow action specs.
//!
//! Forward actions are written to be safe to run more than once with the
//! same inputs (`IF NOT EXISTS` SQL, idempotent directory creation,
//! read-before-append map edits), which is what makes resume-after-crash
//! and retry-after-timeout safe for the engine above.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use sha2::{Digest, Sha256};
use workflow::catalog::{STEP_CREATE_DATABASE, STEP_DOWNLOAD_RELEASE};
use workflow::{ActionSpec, AppKind, StepDef};

use crate::capabilities::command::CommandRunner;
use crate::capabilities::database::DatabaseAdmin;
use crate::capabilities::fs::FileSystem;
use crate::capabilities::secrets::{SecretStore, generate_credential};
use crate::config::ExecutorConfig;
use crate::context::StepContext;
use crate::error::StepError;
use crate::retry::RetryPolicy;

/// Length of generated database and mailbox passwords.
const CREDENTIAL_LEN: usize = 24;

/// Length of generated application salts.
const SALT_LEN: usize = 64;

/// Trait the orchestrator drives steps through.
///
/// [`StepExecutor`] is the production implementation; tests drive the
/// engine with a scripted fake instead.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs a step's forward action, retrying transient failures per policy.
    async fn execute(
        &self,
        step: &StepDef,
        ctx: &StepContext<'_>,
    ) -> Result<serde_json::Value, StepError>;

    /// Runs a step's compensating action once, if it has one.
    async fn compensate(&self, step: &StepDef, ctx: &StepContext<'_>) -> Result<(), StepError>;
}

/// Production step executor over the capability interfaces.
pub struct StepExecutor<C, F, D, S> {
    commands: C,
    fs: F,
    db: D,
    secrets: S,
    config: ExecutorConfig,
    retry: RetryPolicy,
}

impl<C, F, D, S> StepExecutor<C, F, D, S>
where
    C: CommandRunner,
    F: FileSystem,
    D: DatabaseAdmin,
    S: SecretStore,
{
    /// Creates a step executor with the default retry policy.
    pub fn new(commands: C, fs: F, db: D, secrets: S, config: ExecutorConfig) -> Self {
        Self {
            commands,
            fs,
            db,
            secrets,
            config,
            retry: RetryPolicy::default(),
        }
    }

    /// Overrides the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Runs a command and requires exit status 0.
    async fn run_ok(&self, argv: Vec<String>, timeout: Duration) -> Result<(), StepError> {
        self.run_expecting(argv, timeout, &[0]).await
    }

    /// Runs a command and requires one of the given exit statuses.
    async fn run_expecting(
        &self,
        argv: Vec<String>,
        timeout: Duration,
        ok_codes: &[i32],
    ) -> Result<(), StepError> {
        let output = self.commands.run(&argv, timeout).await?;
        if !ok_codes.contains(&output.exit_code) {
            return Err(StepError::Fatal(format!(
                "'{}' exited with status {}",
                argv[0], output.exit_code
            )));
        }
        Ok(())
    }

    fn app_kind(&self, ctx: &StepContext<'_>) -> Result<AppKind, StepError> {
        let app = ctx.param("app")?;
        AppKind::parse(app).ok_or_else(|| StepError::Fatal(format!("unknown application '{app}'")))
    }

    /// Interprets one action. Identifier values spliced into SQL or paths
    /// were restricted to safe character sets at request validation.
    async fn apply(
        &self,
        action: &ActionSpec,
        ctx: &StepContext<'_>,
        timeout: Duration,
    ) -> Result<serde_json::Value, StepError> {
        match action {
            ActionSpec::CreateDatabase => {
                let db_name = ctx.param("db_name")?;
                self.db
                    .execute(&format!("CREATE DATABASE IF NOT EXISTS `{db_name}`"), &[])
                    .await?;
                let password = generate_credential(CREDENTIAL_LEN);
                let credential = self.secrets.put(password).await?;
                Ok(json!({ "db_name": db_name, "credential": credential }))
            }
            ActionSpec::DropDatabase => {
                let db_name = ctx.param("db_name")?;
                self.db
                    .execute(&format!("DROP DATABASE IF EXISTS `{db_name}`"), &[])
                    .await?;
                Ok(json!({}))
            }
            ActionSpec::CreateDbUser => {
                let db_user = ctx.param("db_user")?;
                let credential = ctx.secret_handle(STEP_CREATE_DATABASE, "credential")?;
                let password = self.secrets.reveal(credential).await?;
                self.db
                    .execute(
                        "CREATE USER IF NOT EXISTS ?@'localhost' IDENTIFIED BY ?",
                        &[db_user, &password],
                    )
                    .await?;
                Ok(json!({ "db_user": db_user }))
            }
            ActionSpec::DropDbUser => {
                let db_user = ctx.param("db_user")?;
                self.db
                    .execute("DROP USER IF EXISTS ?@'localhost'", &[db_user])
                    .await?;
                Ok(json!({}))
            }
            ActionSpec::GrantPrivileges => {
                let db_name = ctx.param("db_name")?;
                let db_user = ctx.param("db_user")?;
                self.db
                    .execute(
                        &format!("GRANT ALL PRIVILEGES ON `{db_name}`.* TO ?@'localhost'"),
                        &[db_user],
                    )
                    .await?;
                self.db.execute("FLUSH PRIVILEGES", &[]).await?;
                Ok(json!({}))
            }
            ActionSpec::DownloadRelease => {
                let app = self.app_kind(ctx)?;
                let archive = self.config.archive_path(app);
                self.run_ok(
                    vec![
                        "wget".to_string(),
                        "-q".to_string(),
                        "-O".to_string(),
                        archive.display().to_string(),
                        app.release_url().to_string(),
                    ],
                    timeout,
                )
                .await?;
                Ok(json!({ "archive": archive.display().to_string() }))
            }
            ActionSpec::RemoveDownload => {
                let archive = ctx.output_str(STEP_DOWNLOAD_RELEASE, "archive")?;
                self.fs.remove_file(std::path::Path::new(archive)).await?;
                Ok(json!({}))
            }
            ActionSpec::ExtractAndPlaceFiles => {
                let domain = ctx.param("domain")?;
                let archive = ctx.output_str(STEP_DOWNLOAD_RELEASE, "archive")?;
                let docroot = self.config.document_root(domain);
                self.fs.create_dir_all(&docroot).await?;
                self.run_ok(
                    vec![
                        "tar".to_string(),
                        "xzf".to_string(),
                        archive.to_string(),
                        "-C".to_string(),
                        docroot.display().to_string(),
                        "--strip-components".to_string(),
                        "1".to_string(),
                    ],
                    timeout,
                )
                .await?;
                Ok(json!({ "document_root": docroot.display().to_string() }))
            }
            ActionSpec::RemoveSiteFiles => {
                let domain = ctx.param("domain")?;
                let docroot = self.config.document_root(domain);
                self.fs.remove_dir_all(&docroot).await?;
                // The empty docroot stays; it belongs to the domain resource.
                self.fs.create_dir_all(&docroot).await?;
                Ok(json!({}))
            }
            ActionSpec::WriteAppConfig => {
                let app = self.app_kind(ctx)?;
                let domain = ctx.param("domain")?;
                let db_name = ctx.param("db_name")?;
                let db_user = ctx.param("db_user")?;
                let credential = ctx.secret_handle(STEP_CREATE_DATABASE, "credential")?;
                let password = self.secrets.reveal(credential).await?;

                let contents = match app {
                    AppKind::WordPress => render_wordpress_config(db_name, db_user, &password),
                    AppKind::Joomla => render_joomla_config(domain, db_name, db_user, &password),
                    AppKind::Drupal => render_drupal_config(db_name, db_user, &password),
                };

                let path = self.config.document_root(domain).join(app.config_file());
                self.fs.write(&path, &contents).await?;
                Ok(json!({ "config_file": path.display().to_string() }))
            }
            ActionSpec::SetPermissions => {
                let domain = ctx.param("domain")?;
                let docroot = self.config.document_root(domain).display().to_string();
                let owner = format!("{0}:{0}", self.config.web_user);
                self.run_ok(
                    vec!["chown".to_string(), "-R".to_string(), owner, docroot.clone()],
                    timeout,
                )
                .await?;
                self.run_ok(
                    vec!["chmod".to_string(), "-R".to_string(), "755".to_string(), docroot],
                    timeout,
                )
                .await?;
                Ok(json!({}))
            }
            ActionSpec::CreateDocumentRoot => {
                let domain = ctx.param("domain")?;
                let docroot = self.config.document_root(domain);
                self.fs.create_dir_all(&docroot).await?;
                Ok(json!({ "document_root": docroot.display().to_string() }))
            }
            ActionSpec::RemoveDocumentRoot => {
                let domain = ctx.param("domain")?;
                self.fs
                    .remove_dir_all(&self.config.document_root(domain))
                    .await?;
                Ok(json!({}))
            }
            ActionSpec::WriteWelcomePage => {
                let domain = ctx.param("domain")?;
                let path = self.config.document_root(domain).join("index.html");
                self.fs.write(&path, &render_welcome_page(domain)).await?;
                Ok(json!({ "index": path.display().to_string() }))
            }
            ActionSpec::WriteVhostConfig => {
                let domain = ctx.param("domain")?;
                let docroot = self.config.document_root(domain);
                let path = self.config.vhost_config(domain);
                self.fs
                    .write(&path, &render_vhost_config(domain, &docroot.display().to_string()))
                    .await?;
                Ok(json!({ "vhost": path.display().to_string() }))
            }
            ActionSpec::RemoveVhostConfig => {
                let domain = ctx.param("domain")?;
                self.fs.remove_file(&self.config.vhost_config(domain)).await?;
                Ok(json!({}))
            }
            ActionSpec::EnableSite => {
                let domain = ctx.param("domain")?;
                self.run_ok(
                    vec!["a2ensite".to_string(), format!("{domain}.conf")],
                    timeout,
                )
                .await?;
                self.reload_service("apache2", timeout).await?;
                Ok(json!({}))
            }
            ActionSpec::DisableSite => {
                let domain = ctx.param("domain")?;
                self.run_ok(
                    vec!["a2dissite".to_string(), format!("{domain}.conf")],
                    timeout,
                )
                .await?;
                self.reload_service("apache2", timeout).await?;
                Ok(json!({}))
            }
            ActionSpec::CreateSystemUser => {
                let user = self.mailbox_user(ctx)?;
                // Exit status 9 means the user already exists.
                self.run_expecting(
                    vec![
                        "useradd".to_string(),
                        "-m".to_string(),
                        "-s".to_string(),
                        "/bin/false".to_string(),
                        user.to_string(),
                    ],
                    timeout,
                    &[0, 9],
                )
                .await?;
                Ok(json!({ "user": user }))
            }
            ActionSpec::RemoveSystemUser => {
                let user = self.mailbox_user(ctx)?;
                // Exit status 6 means the user does not exist.
                self.run_expecting(
                    vec!["userdel".to_string(), "-r".to_string(), user.to_string()],
                    timeout,
                    &[0, 6],
                )
                .await?;
                Ok(json!({}))
            }
            ActionSpec::CreateMaildir => {
                let (user, domain) = self.mailbox_parts(ctx)?;
                let maildir = self.config.maildir(domain, user);
                self.fs.create_dir_all(&maildir).await?;
                let domain_dir = self.config.mail_root.join(domain).display().to_string();
                let owner = format!("{0}:{0}", self.config.mail_user);
                self.run_ok(
                    vec!["chown".to_string(), "-R".to_string(), owner, domain_dir.clone()],
                    timeout,
                )
                .await?;
                self.run_ok(
                    vec!["chmod".to_string(), "-R".to_string(), "755".to_string(), domain_dir],
                    timeout,
                )
                .await?;
                Ok(json!({ "maildir": maildir.display().to_string() }))
            }
            ActionSpec::RemoveMaildir => {
                let (user, domain) = self.mailbox_parts(ctx)?;
                self.fs
                    .remove_dir_all(&self.config.maildir(domain, user))
                    .await?;
                Ok(json!({}))
            }
            ActionSpec::RegisterPostfixMap => {
                let email = ctx.param("email")?;
                let user = self.mailbox_user(ctx)?;
                self.fs
                    .append_line(&self.config.postfix_virtual_file, &format!("{email} {user}"))
                    .await?;
                self.run_ok(
                    vec![
                        "postmap".to_string(),
                        self.config.postfix_virtual_file.display().to_string(),
                    ],
                    timeout,
                )
                .await?;
                Ok(json!({}))
            }
            ActionSpec::UnregisterPostfixMap => {
                let email = ctx.param("email")?;
                self.fs
                    .remove_lines_starting_with(
                        &self.config.postfix_virtual_file,
                        &format!("{email} "),
                    )
                    .await?;
                self.run_ok(
                    vec![
                        "postmap".to_string(),
                        self.config.postfix_virtual_file.display().to_string(),
                    ],
                    timeout,
                )
                .await?;
                Ok(json!({}))
            }
            ActionSpec::RegisterDovecotUser => {
                let email = ctx.param("email")?;
                let password = generate_credential(CREDENTIAL_LEN);
                let entry = dovecot_user_entry(email, &password);
                let credential = self.secrets.put(password).await?;
                self.fs
                    .append_line(&self.config.dovecot_users_file, &entry)
                    .await?;
                Ok(json!({ "credential": credential }))
            }
            ActionSpec::UnregisterDovecotUser => {
                let email = ctx.param("email")?;
                self.fs
                    .remove_lines_starting_with(
                        &self.config.dovecot_users_file,
                        &format!("{email}:"),
                    )
                    .await?;
                Ok(json!({}))
            }
            ActionSpec::ReloadMailServices => {
                self.reload_service("postfix", timeout).await?;
                self.reload_service("dovecot", timeout).await?;
                Ok(json!({}))
            }
            ActionSpec::RequestCertificate => {
                let domain = ctx.param("domain")?;
                let email = ctx.param("email")?;
                self.run_ok(
                    vec![
                        "certbot".to_string(),
                        "--apache".to_string(),
                        "-d".to_string(),
                        domain.to_string(),
                        "--email".to_string(),
                        email.to_string(),
                        "--agree-tos".to_string(),
                        "--non-interactive".to_string(),
                    ],
                    timeout,
                )
                .await?;
                Ok(json!({ "certificate": domain }))
            }
            ActionSpec::RevokeCertificate => {
                let domain = ctx.param("domain")?;
                self.run_ok(
                    vec![
                        "certbot".to_string(),
                        "delete".to_string(),
                        "--cert-name".to_string(),
                        domain.to_string(),
                        "--non-interactive".to_string(),
                    ],
                    timeout,
                )
                .await?;
                Ok(json!({}))
            }
            ActionSpec::RecordResource => {
                // The engine writes the ledger entry; nothing to do here.
                Ok(json!({}))
            }
        }
    }

    async fn reload_service(&self, service: &str, timeout: Duration) -> Result<(), StepError> {
        self.run_ok(
            vec![
                "systemctl".to_string(),
                "reload".to_string(),
                service.to_string(),
            ],
            timeout,
        )
        .await
    }

    fn mailbox_user<'a>(&self, ctx: &StepContext<'a>) -> Result<&'a str, StepError> {
        Ok(self.mailbox_parts(ctx)?.0)
    }

    fn mailbox_parts<'a>(&self, ctx: &StepContext<'a>) -> Result<(&'a str, &'a str), StepError> {
        let email = ctx.param("email")?;
        email
            .split_once('@')
            .ok_or_else(|| StepError::Fatal(format!("invalid email address '{email}'")))
    }
}

#[async_trait]
impl<C, F, D, S> Executor for StepExecutor<C, F, D, S>
where
    C: CommandRunner,
    F: FileSystem,
    D: DatabaseAdmin,
    S: SecretStore,
{
    async fn execute(
        &self,
        step: &StepDef,
        ctx: &StepContext<'_>,
    ) -> Result<serde_json::Value, StepError> {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(
                step.timeout,
                self.apply(&step.action, ctx, step.timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StepError::Transient(format!(
                    "step '{}' timed out after {}s",
                    step.name,
                    step.timeout.as_secs()
                ))),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && step.retryable && attempt < self.retry.max_attempts => {
                    metrics::counter!("provision_step_retries_total").increment(1);
                    tracing::warn!(
                        step = step.name,
                        attempt,
                        error = %e,
                        "retrying step after transient failure"
                    );
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn compensate(&self, step: &StepDef, ctx: &StepContext<'_>) -> Result<(), StepError> {
        let Some(action) = &step.compensation else {
            return Ok(());
        };
        match tokio::time::timeout(step.timeout, self.apply(action, ctx, step.timeout)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(StepError::Transient(format!(
                "compensation for step '{}' timed out after {}s",
                step.name,
                step.timeout.as_secs()
            ))),
        }
    }
}

fn render_wordpress_config(db_name: &str, db_user: &str, password: &str) -> String {
    let salts: Vec<String> = [
        "AUTH_KEY",
        "SECURE_AUTH_KEY",
        "LOGGED_IN_KEY",
        "NONCE_KEY",
        "AUTH_SALT",
        "SECURE_AUTH_SALT",
        "LOGGED_IN_SALT",
        "NONCE_SALT",
    ]
    .iter()
    .map(|name| format!("define('{name}', '{}');", generate_credential(SALT_LEN)))
    .collect();

    format!(
        r#"<?php
define('DB_NAME', '{db_name}');
define('DB_USER', '{db_user}');
define('DB_PASSWORD', '{password}');
define('DB_HOST', 'localhost');
define('DB_CHARSET', 'utf8');
define('DB_COLLATE', '');

{salts}

$table_prefix = 'wp_';
define('WP_DEBUG', false);

if ( !defined('ABSPATH') )
    define('ABSPATH', dirname(__FILE__) . '/');

require_once(ABSPATH . 'wp-settings.php');
"#,
        salts = salts.join("\n"),
    )
}

fn render_joomla_config(domain: &str, db_name: &str, db_user: &str, password: &str) -> String {
    format!(
        r#"<?php
class JConfig {{
    public $sitename = '{domain}';
    public $dbtype = 'mysqli';
    public $host = 'localhost';
    public $db = '{db_name}';
    public $user = '{db_user}';
    public $password = '{password}';
    public $dbprefix = 'jos_';
    public $secret = '{secret}';
    public $debug = false;
}}
"#,
        secret = generate_credential(SALT_LEN),
    )
}

fn render_drupal_config(db_name: &str, db_user: &str, password: &str) -> String {
    format!(
        r#"<?php

$databases['default']['default'] = [
  'database' => '{db_name}',
  'username' => '{db_user}',
  'password' => '{password}',
  'host' => 'localhost',
  'port' => '3306',
  'driver' => 'mysql',
  'prefix' => '',
];

$settings['hash_salt'] = '{salt}';
"#,
        salt = generate_credential(SALT_LEN),
    )
}

fn render_welcome_page(domain: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{domain}</title></head>
<body>
<h1>{domain}</h1>
<p>This site has been provisioned and is awaiting content.</p>
</body>
</html>
"#
    )
}

fn render_vhost_config(domain: &str, docroot: &str) -> String {
    format!(
        r#"<VirtualHost *:80>
    ServerName {domain}
    DocumentRoot {docroot}
    ErrorLog ${{APACHE_LOG_DIR}}/{domain}-error.log
    CustomLog ${{APACHE_LOG_DIR}}/{domain}-access.log combined
</VirtualHost>
"#
    )
}

/// Dovecot passwd-file entry with a SHA256 password scheme.
fn dovecot_user_entry(email: &str, password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    format!("{email}:{{SHA256}}{}::::::", BASE64.encode(digest))
}
