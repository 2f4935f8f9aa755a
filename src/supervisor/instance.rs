//! The supervisor's view of an editor instance.

use crate::identity::Identity;

/// An editor instance owned by the host UI.
///
/// The supervisor keeps only a weak reference; dropping the last `Arc` is equivalent to
/// the instance being destroyed without a close handshake.
///
/// All callbacks run on the supervisor's control loop and must not block.
pub trait Instance: Send + Sync + 'static {
    /// Stable identity; also the configuration scope.
    fn id(&self) -> Identity;

    /// Asks the instance to close. Returning `false` means it is busy (e.g. unsaved
    /// changes the user chose to keep) and stays registered.
    fn close(&self) -> bool;

    fn report_error(&self, message: &str);

    fn report_warning(&self, message: &str);

    /// An engine for this instance is now running.
    fn code_started(&self) {}

    /// The engine for this instance ended or could not be started.
    fn code_stopped(&self);
}
