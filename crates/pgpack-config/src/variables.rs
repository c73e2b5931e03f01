//! Variable interpolation for workflow configuration.
//!
//! Supports variables like:
//! - `${tag}` - Extension tag being packaged
//! - `${pg.major}` / `${pg.minor}` - PostgreSQL version parts
//! - `${pg.version}` - `<major>.<minor>`
//! - `${os}` - Build host OS identifier (e.g. `ubuntu-22.04`)
//! - `${dirs.workspace}`, `${dirs.pg_src}`, `${dirs.pg_install}`, `${dirs.extension}`
//! - `${env.VAR_NAME}` - Environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${name}` - Custom variable from the workflow's `vars` block

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub tag: String,
    pub pg: PgContext,
    pub os: String,
    pub dirs: DirsContext,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Custom variables from the workflow
    pub custom: HashMap<String, String>,
}

/// PostgreSQL version variables.
#[derive(Debug, Clone, Default)]
pub struct PgContext {
    pub major: String,
    pub minor: String,
}

/// Directory variables, already resolved to absolute paths.
#[derive(Debug, Clone, Default)]
pub struct DirsContext {
    pub workspace: String,
    pub pg_src: String,
    pub pg_install: String,
    pub extension: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["tag"] => Some(self.tag.clone()),
            ["os"] => Some(self.os.clone()),

            ["pg", "major"] => Some(self.pg.major.clone()),
            ["pg", "minor"] => Some(self.pg.minor.clone()),
            ["pg", "version"] => Some(format!("{}.{}", self.pg.major, self.pg.minor)),

            ["dirs", "workspace"] => Some(self.dirs.workspace.clone()),
            ["dirs", "pg_src"] => Some(self.dirs.pg_src.clone()),
            ["dirs", "pg_install"] => Some(self.dirs.pg_install.clone()),
            ["dirs", "extension"] => Some(self.dirs.extension.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    ///
    /// Unknown variables are left in place so they show up in error output.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Names of variables in `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.ctx.tag = tag.into();
        self
    }

    pub fn with_pg(mut self, major: impl Into<String>, minor: impl Into<String>) -> Self {
        self.ctx.pg.major = major.into();
        self.ctx.pg.minor = minor.into();
        self
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.ctx.os = os.into();
        self
    }

    pub fn with_dirs(mut self, dirs: DirsContext) -> Self {
        self.ctx.dirs = dirs;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
