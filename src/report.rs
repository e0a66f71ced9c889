/// The `(ok, message)` contract shared by every supervisor and deploy
/// operation.
///
/// Operations never raise past this boundary (the fatal render
/// validation path excepted): faults are captured here so the calling
/// layer can display them without exception handling of its own. The
/// message always names the app or path involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReport {
    pub ok: bool,
    pub message: String,
}

impl OpReport {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}
