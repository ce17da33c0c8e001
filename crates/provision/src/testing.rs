//! Test doubles shared by the unit tests of this crate.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::docker::{Command, Container, ExecOutput};

pub(crate) mod fake;

type Responder = Box<dyn Fn(&Command) -> ExecOutput + Send + Sync>;

/// Container answering every command through a closure and recording what
/// it was asked to do.
pub(crate) struct ScriptedContainer {
    responder: Responder,
    commands: Mutex<Vec<Command>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
}

impl ScriptedContainer {
    pub(crate) fn new(responder: impl Fn(&Command) -> ExecOutput + Send + Sync + 'static) -> Self {
        ScriptedContainer {
            responder: Box::new(responder),
            commands: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.commands.lock().expect("commands lock").clone()
    }

    pub(crate) fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().expect("uploads lock").clone()
    }
}

impl Container for ScriptedContainer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn ensure_running(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn exec(&self, command: &Command) -> anyhow::Result<ExecOutput> {
        self.commands.lock().expect("commands lock").push(command.clone());
        Ok((self.responder)(command))
    }

    async fn upload(&self, file: &Path, dest: &str) -> anyhow::Result<()> {
        self.uploads
            .lock()
            .expect("uploads lock")
            .push((file.to_owned(), dest.to_owned()));
        Ok(())
    }
}

/// Value following `flag` in the command line.
pub(crate) fn flag_value<'a>(command: &'a Command, flag: &str) -> Option<&'a str> {
    let position = command.argv.iter().position(|arg| arg == flag)?;
    command.argv.get(position + 1).map(String::as_str)
}

/// Every value following `flag`, for repeatable flags such as `psql -c`.
pub(crate) fn flag_values<'a>(command: &'a Command, flag: &str) -> Vec<&'a str> {
    command
        .argv
        .windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].as_str())
        .collect()
}

pub(crate) fn entity(value: serde_json::Value) -> polystore_model::EntitySpec {
    serde_json::from_value(value).expect("valid entity")
}
