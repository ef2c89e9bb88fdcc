pub mod filter;
pub mod window;

pub use filter::{
    apply_limit, dm_peer, dm_recipient, find_substring, has_all_tags, in_time_range, is_self_dm, matches_filter,
    matches_search_attributes, matches_subscription, priority_of,
};
pub use window::{position_after, window_range};
