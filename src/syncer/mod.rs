//! The level-triggered half of the controller: independent timer loops that
//! repeatedly reconcile cluster state against the build engine, the cron
//! schedule, the log store and the registry certificate. Each loop exits
//! promptly when its cancellation token fires; a failed tick is logged and
//! retried on the next interval with no extra backoff.

pub mod cron;
pub mod logs;
pub mod registry_cert;
pub mod state;
