#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcmdError {
    /// Malformed request: unknown id, bad module type, oversized payload.
    #[error("invalid argument")]
    InvalidArgument,
    /// The caller does not own the command buffer it is operating on.
    #[error("not the owner of this command buffer")]
    NotOwner,
    /// The command buffer does not end in a chain-capable JMP instruction.
    #[error("command buffer has no trailing JMP")]
    MalformedCmdbuf,
    /// DMA slab allocation failed.
    #[error("out of DMA memory")]
    NoMemory,
    /// A blocking wait was cancelled by the caller's cancellation token.
    #[error("operation interrupted")]
    Interrupted,
    /// A bounded wait expired: `wait_any` deadline or abort spin-wait ceiling.
    #[error("timed out")]
    Timeout,
    /// Shared list/register state read back inconsistent; the operation was
    /// abandoned to avoid corrupting the queues.
    #[error("internal consistency fault")]
    Internal,
}
