/*!
 * Call-out Module
 * CPU selection and sibling domain configuration through kernel subprograms
 */

mod invoker;
mod types;

pub use invoker::CalloutInvoker;
pub use types::{CalloutStats, CpuSelection, SubprogramStats};
