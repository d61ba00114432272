//! `${Env.NAME}` substitution for supervised command lines.
//!
//! A token is looked up in the command's own variables first and then in the
//! shared context. Values may themselves contain tokens, which are expanded
//! before substitution. Unknown tokens, and tokens that refer back to a
//! variable already being expanded, stay in the output literally.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{Env\.([^}]+)\}").expect("token pattern is valid"));

const MAX_DEPTH: usize = 16;

/// Shared variables visible to every supervised command, usually the
/// supervisor's own environment.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    variables: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment.
    pub fn from_env() -> Self {
        Self {
            variables: std::env::vars().collect(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}

/// A command line template plus the variables scoped to it.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub args: Vec<String>,
    pub variables: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            variables: HashMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Arguments with every resolvable token substituted.
    pub fn resolve(&self, context: &VariableContext) -> Vec<String> {
        let resolver = Resolver {
            scoped: &self.variables,
            context,
        };
        self.args
            .iter()
            .map(|arg| resolver.expand(arg, &mut Vec::new()))
            .collect()
    }

    /// The resolved arguments joined with spaces, for logging.
    pub fn command_line(&self, context: &VariableContext) -> String {
        self.resolve(context).join(" ")
    }
}

struct Resolver<'a> {
    scoped: &'a HashMap<String, String>,
    context: &'a VariableContext,
}

impl Resolver<'_> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.scoped
            .get(name)
            .map(String::as_str)
            .or_else(|| self.context.get(name))
    }

    fn expand(&self, input: &str, active: &mut Vec<String>) -> String {
        TOKEN
            .replace_all(input, |caps: &Captures| {
                let name = &caps[1];
                if active.len() >= MAX_DEPTH || active.iter().any(|a| a == name) {
                    return caps[0].to_string();
                }
                match self.lookup(name) {
                    Some(value) => {
                        active.push(name.to_string());
                        let expanded = self.expand(value, active);
                        active.pop();
                        expanded
                    }
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}
