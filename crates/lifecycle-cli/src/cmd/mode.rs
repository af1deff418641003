use crate::cmd::open_store;
use crate::output::print_json;
use clap::ValueEnum;
use lifecycle_core::{
    admin,
    store::{MetaExt, Subsystem},
    types::OperationMode,
};
use std::path::Path;

#[derive(Clone, Copy, ValueEnum)]
pub enum SubsystemArg {
    Ilm,
    Slm,
}

impl From<SubsystemArg> for Subsystem {
    fn from(arg: SubsystemArg) -> Self {
        match arg {
            SubsystemArg::Ilm => Subsystem::Ilm,
            SubsystemArg::Slm => Subsystem::Slm,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Start,
    Stop,
}

impl From<ModeArg> for OperationMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Start => OperationMode::Running,
            ModeArg::Stop => OperationMode::Stopped,
        }
    }
}

pub fn run(
    root: &Path,
    subsystem: SubsystemArg,
    set: Option<ModeArg>,
    json: bool,
) -> anyhow::Result<()> {
    let subsystem = Subsystem::from(subsystem);
    let store = open_store(root)?;
    let mode = match set {
        Some(requested) => admin::set_operation_mode(&store, subsystem, requested.into())?,
        None => store.operation_mode(subsystem)?,
    };

    if json {
        print_json(&serde_json::json!({
            "subsystem": subsystem,
            "operation_mode": mode,
        }))
    } else {
        println!("{}: {mode}", subsystem.as_str());
        Ok(())
    }
}
