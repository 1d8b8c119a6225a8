//! The versioned workflow catalog.
//!
//! One definition per operation. Step tables here mirror what the step
//! executor can interpret; they carry no side effects themselves.

use ledger::ResourceKind;

use crate::definition::{
    ActionSpec, DOWNLOAD_TIMEOUT, Precondition, StepDef, WorkflowDefinition,
};
use crate::operation::Operation;

/// Step name: create the domain document root.
pub const STEP_CREATE_DOCROOT: &str = "create-docroot";
/// Step name: write the placeholder index page.
pub const STEP_WRITE_WELCOME_PAGE: &str = "write-welcome-page";
/// Step name: write the virtual-host config.
pub const STEP_WRITE_VHOST_CONFIG: &str = "write-vhost-config";
/// Step name: enable the site in the web server.
pub const STEP_ENABLE_SITE: &str = "enable-site";
/// Step name: record the domain in the ledger.
pub const STEP_RECORD_DOMAIN: &str = "record-domain";

/// Step name: create the MySQL database.
pub const STEP_CREATE_DATABASE: &str = "create-database";
/// Step name: create the MySQL user.
pub const STEP_CREATE_DB_USER: &str = "create-db-user";
/// Step name: grant the user privileges on the database.
pub const STEP_GRANT_PRIVILEGES: &str = "grant-privileges";

/// Step name: download the application release archive.
pub const STEP_DOWNLOAD_RELEASE: &str = "download-release";
/// Step name: unpack the archive into the document root.
pub const STEP_EXTRACT_AND_PLACE_FILES: &str = "extract-and-place-files";
/// Step name: write the application config file.
pub const STEP_WRITE_CONFIG_FILE: &str = "write-config-file";
/// Step name: set ownership and modes on the document root.
pub const STEP_SET_PERMISSIONS: &str = "set-permissions";
/// Step name: record the installation in the ledger.
pub const STEP_RECORD_INSTALLATION: &str = "record-installation";

/// Step name: create the mail system user.
pub const STEP_CREATE_SYSTEM_USER: &str = "create-system-user";
/// Step name: create the maildir.
pub const STEP_CREATE_MAILDIR: &str = "create-maildir";
/// Step name: register the address in the postfix virtual map.
pub const STEP_REGISTER_POSTFIX_MAP: &str = "register-postfix-map";
/// Step name: register the account in the dovecot users file.
pub const STEP_REGISTER_DOVECOT_USER: &str = "register-dovecot-user";
/// Step name: reload postfix and dovecot.
pub const STEP_RELOAD_MAIL_SERVICES: &str = "reload-mail-services";
/// Step name: record the email account in the ledger.
pub const STEP_RECORD_EMAIL_ACCOUNT: &str = "record-email-account";

/// Step name: request the certificate from the ACME client.
pub const STEP_REQUEST_CERTIFICATE: &str = "request-certificate";
/// Step name: record the certificate in the ledger.
pub const STEP_RECORD_CERTIFICATE: &str = "record-certificate";

/// Returns the workflow definition for an operation.
pub fn definition_for(operation: &Operation) -> WorkflowDefinition {
    match operation {
        Operation::CreateDomain => create_domain(),
        Operation::CreateDatabase => create_database(),
        Operation::InstallApp(_) => install_app(operation.name()),
        Operation::CreateEmailAccount => create_email_account(),
        Operation::IssueCertificate => issue_certificate(),
    }
}

/// Looks up a workflow definition by its persisted name.
pub fn definition_by_name(name: &str) -> Option<WorkflowDefinition> {
    Operation::parse(name).map(|op| definition_for(&op))
}

fn create_domain() -> WorkflowDefinition {
    WorkflowDefinition {
        name: "create_domain",
        version: 1,
        steps: vec![
            StepDef::new(STEP_CREATE_DOCROOT, ActionSpec::CreateDocumentRoot)
                .compensated_by(ActionSpec::RemoveDocumentRoot),
            // Independent of each other; both only need the docroot.
            StepDef::new(STEP_WRITE_WELCOME_PAGE, ActionSpec::WriteWelcomePage)
                .in_group("site-files"),
            StepDef::new(STEP_WRITE_VHOST_CONFIG, ActionSpec::WriteVhostConfig)
                .compensated_by(ActionSpec::RemoveVhostConfig)
                .in_group("site-files"),
            StepDef::new(STEP_ENABLE_SITE, ActionSpec::EnableSite)
                .compensated_by(ActionSpec::DisableSite)
                .retryable(),
            StepDef::new(STEP_RECORD_DOMAIN, ActionSpec::RecordResource)
                .records(ResourceKind::Domain, "domain"),
        ],
        preconditions: Operation::CreateDomain.preconditions(),
    }
}

fn create_database() -> WorkflowDefinition {
    WorkflowDefinition {
        name: "create_database",
        version: 1,
        steps: database_steps(),
        preconditions: Operation::CreateDatabase.preconditions(),
    }
}

/// Shared prefix of `create_database` and the app installers.
fn database_steps() -> Vec<StepDef> {
    vec![
        StepDef::new(STEP_CREATE_DATABASE, ActionSpec::CreateDatabase)
            .compensated_by(ActionSpec::DropDatabase)
            .retryable()
            .records(ResourceKind::Database, "db_name"),
        StepDef::new(STEP_CREATE_DB_USER, ActionSpec::CreateDbUser)
            .compensated_by(ActionSpec::DropDbUser)
            .retryable()
            .consumes(&[STEP_CREATE_DATABASE]),
        StepDef::new(STEP_GRANT_PRIVILEGES, ActionSpec::GrantPrivileges).retryable(),
    ]
}

fn install_app(name: &'static str) -> WorkflowDefinition {
    let mut steps = database_steps();
    steps.extend([
        StepDef::new(STEP_DOWNLOAD_RELEASE, ActionSpec::DownloadRelease)
            .compensated_by(ActionSpec::RemoveDownload)
            .retryable()
            .timeout(DOWNLOAD_TIMEOUT),
        StepDef::new(STEP_EXTRACT_AND_PLACE_FILES, ActionSpec::ExtractAndPlaceFiles)
            .compensated_by(ActionSpec::RemoveSiteFiles)
            .consumes(&[STEP_DOWNLOAD_RELEASE]),
        StepDef::new(STEP_WRITE_CONFIG_FILE, ActionSpec::WriteAppConfig)
            .consumes(&[STEP_CREATE_DATABASE]),
        StepDef::new(STEP_SET_PERMISSIONS, ActionSpec::SetPermissions),
        StepDef::new(STEP_RECORD_INSTALLATION, ActionSpec::RecordResource)
            .records(ResourceKind::AppInstall, "domain"),
    ]);

    WorkflowDefinition {
        name,
        version: 1,
        steps,
        preconditions: vec![Precondition::ResourceActive {
            kind: ResourceKind::Domain,
            key_param: "domain",
        }],
    }
}

fn create_email_account() -> WorkflowDefinition {
    WorkflowDefinition {
        name: "create_email_account",
        version: 1,
        steps: vec![
            StepDef::new(STEP_CREATE_SYSTEM_USER, ActionSpec::CreateSystemUser)
                .compensated_by(ActionSpec::RemoveSystemUser),
            StepDef::new(STEP_CREATE_MAILDIR, ActionSpec::CreateMaildir)
                .compensated_by(ActionSpec::RemoveMaildir),
            StepDef::new(STEP_REGISTER_POSTFIX_MAP, ActionSpec::RegisterPostfixMap)
                .compensated_by(ActionSpec::UnregisterPostfixMap),
            StepDef::new(STEP_REGISTER_DOVECOT_USER, ActionSpec::RegisterDovecotUser)
                .compensated_by(ActionSpec::UnregisterDovecotUser),
            StepDef::new(STEP_RELOAD_MAIL_SERVICES, ActionSpec::ReloadMailServices).retryable(),
            StepDef::new(STEP_RECORD_EMAIL_ACCOUNT, ActionSpec::RecordResource)
                .records(ResourceKind::EmailAccount, "email"),
        ],
        preconditions: Operation::CreateEmailAccount.preconditions(),
    }
}

fn issue_certificate() -> WorkflowDefinition {
    WorkflowDefinition {
        name: "issue_certificate",
        version: 1,
        steps: vec![
            StepDef::new(STEP_REQUEST_CERTIFICATE, ActionSpec::RequestCertificate)
                .compensated_by(ActionSpec::RevokeCertificate)
                .retryable()
                .timeout(DOWNLOAD_TIMEOUT),
            StepDef::new(STEP_RECORD_CERTIFICATE, ActionSpec::RecordResource)
                .records(ResourceKind::Certificate, "domain"),
        ],
        preconditions: Operation::IssueCertificate.preconditions(),
    }
}

#[cfg(test)]
mod tests {
    use crate::operation::AppKind;

    use super::*;

    fn all_operations() -> Vec<Operation> {
        vec![
            Operation::CreateDomain,
            Operation::CreateDatabase,
            Operation::InstallApp(AppKind::WordPress),
            Operation::InstallApp(AppKind::Joomla),
            Operation::InstallApp(AppKind::Drupal),
            Operation::CreateEmailAccount,
            Operation::IssueCertificate,
        ]
    }

    #[test]
    fn install_workflow_step_order() {
        let def = definition_for(&Operation::InstallApp(AppKind::WordPress));
        assert_eq!(def.name, "install_wordpress");
        assert_eq!(
            def.step_names(),
            vec![
                "create-database",
                "create-db-user",
                "grant-privileges",
                "download-release",
                "extract-and-place-files",
                "write-config-file",
                "set-permissions",
                "record-installation",
            ]
        );
    }

    #[test]
    fn definition_by_name_matches_operation_names() {
        for op in all_operations() {
            let def = definition_by_name(op.name()).unwrap();
            assert_eq!(def.name, op.name());
            assert!(!def.steps.is_empty());
        }
        assert!(definition_by_name("install_rails").is_none());
    }

    #[test]
    fn step_names_are_unique_within_each_workflow() {
        for op in all_operations() {
            let def = definition_for(&op);
            let names = def.step_names();
            let mut deduped = names.clone();
            deduped.sort_unstable();
            deduped.dedup();
            assert_eq!(names.len(), deduped.len(), "{}", def.name);
        }
    }

    #[test]
    fn consumed_outputs_come_from_earlier_steps() {
        for op in all_operations() {
            let def = definition_for(&op);
            for (i, step) in def.steps.iter().enumerate() {
                for consumed in step.consumes {
                    let position = def.steps.iter().position(|s| s.name == *consumed);
                    assert!(
                        position.is_some_and(|p| p < i),
                        "{}: step '{}' consumes '{}' which does not precede it",
                        def.name,
                        step.name,
                        consumed
                    );
                }
            }
        }
    }

    #[test]
    fn recording_steps_key_on_declared_params() {
        for op in all_operations() {
            let def = definition_for(&op);
            let recording: Vec<_> = def.steps.iter().filter(|s| s.records.is_some()).collect();
            assert!(!recording.is_empty(), "{} records nothing", def.name);
            for step in recording {
                let spec = step.records.unwrap();
                assert!(
                    ["domain", "db_name", "email"].contains(&spec.key_param),
                    "{}: unexpected key param {}",
                    def.name,
                    spec.key_param
                );
            }
        }
    }

    #[test]
    fn download_steps_get_the_long_timeout() {
        let def = definition_for(&Operation::InstallApp(AppKind::Drupal));
        let download = def.step(STEP_DOWNLOAD_RELEASE).unwrap();
        assert_eq!(download.timeout, DOWNLOAD_TIMEOUT);
        assert!(download.retryable);

        let config = def.step(STEP_WRITE_CONFIG_FILE).unwrap();
        assert_eq!(config.timeout, crate::definition::LOCAL_OP_TIMEOUT);
        assert!(!config.retryable);
    }

    #[test]
    fn parallel_groups_only_in_domain_setup() {
        let def = definition_for(&Operation::CreateDomain);
        let grouped: Vec<_> = def
            .steps
            .iter()
            .filter(|s| s.parallel_group.is_some())
            .map(|s| s.name)
            .collect();
        assert_eq!(grouped, vec![STEP_WRITE_WELCOME_PAGE, STEP_WRITE_VHOST_CONFIG]);

        for op in [
            Operation::CreateDatabase,
            Operation::InstallApp(AppKind::WordPress),
            Operation::CreateEmailAccount,
            Operation::IssueCertificate,
        ] {
            let def = definition_for(&op);
            assert!(def.steps.iter().all(|s| s.parallel_group.is_none()));
        }
    }

    #[test]
    fn create_database_workflow_records_the_database() {
        let def = definition_for(&Operation::CreateDatabase);
        let create = def.step(STEP_CREATE_DATABASE).unwrap();
        let spec = create.records.unwrap();
        assert_eq!(spec.kind, ResourceKind::Database);
        assert_eq!(spec.key_param, "db_name");
        assert_eq!(create.compensation, Some(ActionSpec::DropDatabase));
    }
}
