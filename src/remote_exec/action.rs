use crate::error::{FileTreeError, RemoteExecutionError};
use crate::protocol::tree::split_path;
use crate::protocol::{Digest, FileTreeBuilder, InputFile, Protocol, UploadDataSupplier};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// A build rule's request to run one command.
#[derive(Debug, Clone, Default)]
pub struct BuildAction {
    pub target: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub inputs: FileTreeBuilder,
    /// Paths relative to the output root
    pub outputs: Vec<PathBuf>,
}

impl BuildAction {
    pub fn new<I, S>(target: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    pub fn with_input(mut self, path: impl AsRef<Path>, file: InputFile) -> Result<Self, FileTreeError> {
        self.inputs.add_file(path, file)?;
        Ok(self)
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Declared outputs must stay below the output root: relative, without `..`, non-empty.
    pub fn validate_outputs(&self) -> Result<(), FileTreeError> {
        for output in &self.outputs {
            if split_path(output)?.is_empty() {
                return Err(FileTreeError::InvalidPath(output.clone()));
            }
        }
        Ok(())
    }
}

/// The computed remote form of a [`BuildAction`].
#[derive(Debug)]
pub struct RemoteExecutionActionInfo {
    pub action_digest: Digest,
    required_data: HashMap<Digest, UploadDataSupplier>,
    pub outputs: Vec<PathBuf>,
    pub input_file_count: usize,
    pub input_file_bytes: u64,
}

impl RemoteExecutionActionInfo {
    /// Size of every blob the action needs in storage: files, directories, command, action
    pub fn total_input_size(&self) -> u64 {
        self.required_data.keys().map(|d| d.size_bytes).sum()
    }

    pub fn required_blob_count(&self) -> usize {
        self.required_data.len()
    }

    /// Moves the upload set out. Later calls return an empty map.
    pub fn take_required_data(&mut self) -> HashMap<Digest, UploadDataSupplier> {
        std::mem::take(&mut self.required_data)
    }
}

/// Builds the input tree, command and action for `action`, collecting every blob that has
/// to be present in storage before execution.
pub fn prepare_remote_execution(
    protocol: &Protocol,
    action: &BuildAction,
) -> Result<RemoteExecutionActionInfo, RemoteExecutionError> {
    let computation_error = |reason: String| RemoteExecutionError::ActionComputation {
        target: action.target.clone(),
        reason,
    };

    action
        .validate_outputs()
        .map_err(|e| computation_error(e.to_string()))?;

    let mut required_data = HashMap::new();
    let input_root = action
        .inputs
        .build_tree(protocol, |digest, data| {
            required_data.insert(digest, data);
        })
        .map_err(|e| computation_error(e.to_string()))?;

    let command = protocol.new_command(
        action.arguments.iter().cloned(),
        action.environment.clone(),
        &action.outputs,
    );
    let (command_digest, command_bytes) = protocol
        .digest_message(&command)
        .map_err(|e| computation_error(e.to_string()))?;
    required_data.insert(command_digest.clone(), UploadDataSupplier::from_bytes(command_bytes));

    let remote_action = protocol.new_action(command_digest, input_root);
    let (action_digest, action_bytes) = protocol
        .digest_message(&remote_action)
        .map_err(|e| computation_error(e.to_string()))?;
    required_data.insert(action_digest.clone(), UploadDataSupplier::from_bytes(action_bytes));

    let mut outputs = action.outputs.clone();
    outputs.sort();
    outputs.dedup();

    Ok(RemoteExecutionActionInfo {
        action_digest,
        required_data,
        outputs,
        input_file_count: action.inputs.file_count(),
        input_file_bytes: action.inputs.file_bytes(),
    })
}
