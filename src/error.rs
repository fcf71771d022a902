use thiserror::Error;

/// Reasons a submission run stops early. In every case the progress store
/// still points at the last acknowledged batch.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Authentication failed (code {code}): {message}. Re-authenticate and run again.")]
    Authentication { code: u32, message: String },

    #[error("Request rejected{}: {message}", code_suffix(.code))]
    Rejected { code: Option<u32>, message: String },

    #[error("Giving up after {attempts} failed attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("Failed saving progress: {0:#}")]
    Checkpoint(anyhow::Error),
}

fn code_suffix(code: &Option<u32>) -> String {
    code.map(|code| format!(" (code {code})"))
        .unwrap_or_default()
}
