//! Core trait definitions shared across the Canopy crates.

/// A type that carries a stable, human-readable identifier.
pub trait Named {
    /// The identifier used in logs, state files and diagnostics.
    fn name(&self) -> &str;
}

/// A type that can produce a summary of its contents.
pub trait Summarizable {
    /// A one-line summary suitable for display.
    fn summary(&self) -> String;
}

/// Checkpoint/rollback capability.
///
/// `store` commits the current value as the checkpoint, `restore` rolls the
/// current value back to it. Between the two calls only the current value
/// may change.
pub trait Checkpointable {
    /// Commit the current value.
    fn store(&mut self);

    /// Roll back to the last committed value.
    fn restore(&mut self);
}
