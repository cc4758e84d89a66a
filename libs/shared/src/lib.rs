pub mod shell_session;
