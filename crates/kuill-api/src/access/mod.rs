//! Permission resolution for the UI and the watch aggregator

mod handlers;
mod resolver;
mod resources;
mod review;

pub use handlers::{
    access_review_handler, resources_list_handler, watchable_handler, AccessReviewQuery,
};
pub use resolver::{AccessResolution, AccessResolver, Permission, ResourcePermissions};
pub use resources::{ResourceLister, ResourceLists};
pub use review::{AccessReviewer, BackendAccessReviewer, ReviewRequest};

#[cfg(test)]
pub(crate) use review::MockAccessReviewer;
