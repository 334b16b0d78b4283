//! Behavioural suites for the dispatcher.
