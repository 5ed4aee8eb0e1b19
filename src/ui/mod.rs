pub mod chat_view;
pub mod widget;
