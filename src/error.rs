//! Crate-wide error type.
//!
//! Every fallible core operation (allocator, memdb, page tables, VGIC
//! configuration, PSCI) returns `Result<T, HvError>`. The variants mirror
//! the abstract error categories of the hypervisor's hypercall ABI so that
//! glue code at the edges can translate them 1:1 into the wire format
//! without inventing new failure modes.

#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum HvError {
    #[error("no memory available to satisfy the request")]
    NoMem,
    #[error("address range overflows the address space")]
    AddrOverflow,
    #[error("address is not valid for this operation")]
    AddrInvalid,
    #[error("argument is invalid")]
    ArgumentInvalid,
    #[error("argument violates an alignment requirement")]
    ArgumentAlignment,
    #[error("argument violates a size requirement")]
    ArgumentSize,
    #[error("an existing mapping conflicts with this request")]
    ExistingMapping,
    #[error("resource is busy")]
    Busy,
    #[error("request denied by policy")]
    Denied,
    #[error("operation would idle")]
    Idle,
    #[error("caller should retry")]
    Retry,
    #[error("unspecified failure")]
    Failure,
    #[error("object configuration is invalid")]
    ObjectConfig,
    #[error("object is in the wrong lifecycle state for this operation")]
    ObjectState,
    #[error("freed range overlaps an existing free range")]
    AllocatorRangeOverlapping,
    #[error("memory is still in use")]
    AllocatorMemInUse,
    #[error("virq is not bound to a source")]
    VirqNotBound,
    #[error("virq is already bound to a source")]
    VirqBound,
}

pub type HvResult<T> = Result<T, HvError>;
