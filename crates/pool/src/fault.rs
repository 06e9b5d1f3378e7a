/// A categorized execution failure, surfaced to the router as a
/// structured fault. Distinguishes faults the user's code caused from
/// platform faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// No deployment matches the requested id.
    NotFound,
    /// The deployment's code failed to compile. Fatal for the deployment
    /// until it is redeployed.
    CompileError(String),
    /// The invocation exceeded the deployment's wall-clock bound. The
    /// context survives a single timeout.
    Timeout,
    /// An uncaught exception inside the handler. Non-fatal to the context.
    RuntimeFault(String),
    /// The sandbox itself is no longer usable (heap exhaustion,
    /// engine-level crash). The context is torn down and rebuilt on the
    /// next invocation.
    SandboxCorrupted(String),
}

impl FaultKind {
    /// Whether the user's code, rather than the platform, caused the fault.
    pub fn user_fault(&self) -> bool {
        matches!(
            self,
            FaultKind::CompileError(_) | FaultKind::Timeout | FaultKind::RuntimeFault(_)
        )
    }

    /// HTTP-equivalent status recorded for a faulted invocation.
    pub fn status_code(&self) -> u16 {
        match self {
            FaultKind::NotFound => 404,
            FaultKind::Timeout => 504,
            FaultKind::CompileError(_)
            | FaultKind::RuntimeFault(_)
            | FaultKind::SandboxCorrupted(_) => 500,
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::NotFound => write!(f, "deployment not found"),
            FaultKind::CompileError(message) => write!(f, "compile error: {}", message),
            FaultKind::Timeout => write!(f, "invocation timed out"),
            FaultKind::RuntimeFault(message) => write!(f, "runtime fault: {}", message),
            FaultKind::SandboxCorrupted(message) => write!(f, "sandbox corrupted: {}", message),
        }
    }
}

impl std::error::Error for FaultKind {}
