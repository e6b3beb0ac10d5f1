use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use elfload::LoadError;

/// All errors produced by the `elfload` command.
///
/// - **Input/output errors** (exit code 2): unreadable input, failed output
/// - **Load errors**: exit code of the underlying [`LoadError`]
///   (1 for format errors, 2 for resource errors)
#[derive(thiserror::Error, Debug)]
pub enum ElfloadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ElfloadError {
    /// Numeric exit status (1 or 2).
    pub fn exit_status(&self) -> u8 {
        match self {
            Self::Load(e) => e.exit_status(),
            Self::Read { .. } | Self::Io(_) | Self::Json(_) => 2,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_path() {
        let err = ElfloadError::Read {
            path: PathBuf::from("/nonexistent/a.out"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/nonexistent/a.out"));
        assert_eq!(err.exit_status(), 2);
    }

    #[test]
    fn load_error_is_transparent() {
        let err = ElfloadError::from(LoadError::UnsupportedClass { class: 1 });
        assert_eq!(
            err.to_string(),
            LoadError::UnsupportedClass { class: 1 }.to_string()
        );
        assert_eq!(err.exit_status(), 1);
    }
}
