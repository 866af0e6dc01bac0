mod dispatch;
pub mod helpers;
mod lifecycle;
