use crate::config::EngineConfig;
use crate::error::InjectError;
use log::debug;
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;

/// Logical names of the unit templates every adapter can ask for.
pub const ANSIBLE_PLAYBOOK: &str = "ansiblePlaybook";
pub const ANSIBLE_FILE_UPLOAD_PLAYBOOK: &str = "ansibleFileUploadPlaybook";
pub const PUPPET_MODULE: &str = "puppetModule";
pub const PUPPET_FILE_UPLOAD_MODULE: &str = "puppetFileUploadModule";
pub const SALT_STATE: &str = "saltState";
pub const SALT_FILE_UPLOAD_STATE: &str = "saltFileUploadState";
pub const CHEF_COOKBOOK: &str = "chefCookbook";
pub const CHEF_FILE_COOKBOOK: &str = "chefFileCookbook";
pub const CHEF_METADATA: &str = "metadata.rb";

const BUILTIN: &[(&str, &str)] = &[
    (ANSIBLE_PLAYBOOK, include_str!("../templates/ansible_playbook.tmpl")),
    (ANSIBLE_FILE_UPLOAD_PLAYBOOK, include_str!("../templates/ansible_file_upload_playbook.tmpl")),
    (PUPPET_MODULE, include_str!("../templates/puppet_module.tmpl")),
    (PUPPET_FILE_UPLOAD_MODULE, include_str!("../templates/puppet_file_upload_module.tmpl")),
    (SALT_STATE, include_str!("../templates/salt_state.tmpl")),
    (SALT_FILE_UPLOAD_STATE, include_str!("../templates/salt_file_upload_state.tmpl")),
    (CHEF_COOKBOOK, include_str!("../templates/chef_cookbook.tmpl")),
    (CHEF_FILE_COOKBOOK, include_str!("../templates/chef_file_cookbook.tmpl")),
    (CHEF_METADATA, include_str!("../templates/metadata_rb.tmpl")),
];

/// String fields every template may reference.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TemplateFields {
    pub cmd: String,
    pub cmd_name: String,
    pub file_name: String,
    pub file_path: String,
    pub class_name: String,
    pub state_name: String,
    pub payload_name: String,
}

impl TemplateFields {
    pub fn from_config(config: &EngineConfig) -> Self {
        TemplateFields {
            cmd: config.cmd.clone().unwrap_or_default(),
            cmd_name: config.payload_name.clone(),
            file_name: config.upload_file_name().unwrap_or_default(),
            file_path: config.remote_upload_path.clone(),
            class_name: config.payload_name.clone(),
            state_name: config.payload_name.clone(),
            payload_name: config.payload_name.clone(),
        }
    }
}

/// Open by logical name, render with fields, get text back.
pub struct TemplateStore {
    env: Environment<'static>,
}

impl TemplateStore {
    pub fn builtin() -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        // JSON strings are valid double-quoted YAML scalars.
        env.add_filter("yaml_str", |value: String| {
            serde_json::to_string(&value).unwrap_or_else(|_| format!("{value:?}"))
        });
        // Single-quoted Puppet and Ruby literals.
        env.add_filter("squote", |value: String| value.replace('\\', "\\\\").replace('\'', "\\'"));

        for (name, source) in BUILTIN {
            if let Err(e) = env.add_template(*name, *source) {
                log::error!("Built-in template {name} is invalid: {e}");
            }
        }
        TemplateStore { env }
    }

    pub fn render(&self, name: &str, fields: &TemplateFields) -> Result<String, InjectError> {
        let template = self.env.get_template(name).map_err(|e| InjectError::Template {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let text = template.render(fields).map_err(|e| InjectError::Template {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Rendered template {name} ({} bytes)", text.len());
        Ok(text)
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::builtin()
    }
}
