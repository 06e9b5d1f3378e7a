/// One completed invocation, metered. Produced exactly once per
/// invocation, including ones that faulted (with an error status code).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InvocationResult {
    pub function_id: String,
    pub deployment_id: String,
    /// CPU time attributed to this invocation, in microseconds.
    pub cpu_time_us: u64,
    /// Heap usage attributed to this invocation, in bytes.
    pub memory_bytes: u64,
    /// Request body size.
    pub received_bytes: u64,
    /// Response body size.
    pub sent_bytes: u64,
    pub status_code: u16,
    /// Unix epoch milliseconds at completion.
    pub timestamp_ms: u64,
}

impl InvocationResult {
    /// Buffer grouping key.
    pub fn key(&self) -> (String, String) {
        (self.function_id.clone(), self.deployment_id.clone())
    }
}
