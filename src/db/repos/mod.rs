pub mod connections;
pub mod creators;
pub mod items;
pub mod mailboxes;
pub mod newsletter_feeds;
pub mod subscriptions;
pub mod user_items;
