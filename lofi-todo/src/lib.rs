//! Library surface of the todo app: the shared-list type, reused by
//! the binary and by integration tests.

pub mod todolist;

pub use todolist::{TodoItem, TodoList};
