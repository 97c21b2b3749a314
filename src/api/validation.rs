//! Frame request validation.

use crate::api::error::ApiError;
use rqd_protocol::RunFrame;

/// Validate a name that becomes part of a log file name.
///
/// Rules:
/// - Length: 1..=max_len characters
/// - No path separators (/, \) and no NUL
/// - Not `.` or `..`
pub fn validate_file_component(name: &str, kind: &str, max_len: usize) -> Result<(), ApiError> {
    if name.is_empty() {
        return Err(ApiError::bad_request(format!("{} cannot be empty", kind)));
    }

    if name.len() > max_len {
        return Err(ApiError::bad_request(format!(
            "{} too long: {} characters (max {})",
            kind,
            name.len(),
            max_len
        )));
    }

    if name == "." || name == ".." {
        return Err(ApiError::bad_request(format!("{} cannot be '{}'", kind, name)));
    }

    for c in name.chars() {
        if c == '/' || c == '\\' {
            return Err(ApiError::bad_request(format!(
                "{} cannot contain path separators",
                kind
            )));
        }
        if c == '\0' {
            return Err(ApiError::bad_request(format!("{} cannot contain NUL", kind)));
        }
    }

    Ok(())
}

/// Validate that a command is not empty.
pub fn validate_command(cmd: &str) -> Result<(), ApiError> {
    if cmd.trim().is_empty() {
        return Err(ApiError::bad_request("command cannot be empty"));
    }
    Ok(())
}

/// Structural checks before a launch request reaches the agent.
///
/// Resource and user checks belong to the agent, which reports them with
/// their own error kinds.
pub fn validate_run_frame(frame: &RunFrame) -> Result<(), ApiError> {
    validate_file_component(&frame.frame_id, "frame_id", 255)?;
    validate_file_component(&frame.job_name, "job_name", 255)?;
    validate_file_component(&frame.frame_name, "frame_name", 255)?;
    validate_command(&frame.command)?;
    if !frame.log_dir.starts_with('/') {
        return Err(ApiError::bad_request(format!(
            "log_dir must be absolute: '{}'",
            frame.log_dir
        )));
    }
    if frame.user_name.is_empty() {
        return Err(ApiError::bad_request("user_name cannot be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_component() {
        let cases = [
            ("shot010-lighting", true),
            ("0001-render", true),
            ("", false),
            ("..", false),
            ("a/b", false),
            ("a\\b", false),
            ("a\0b", false),
        ];
        for (name, ok) in cases {
            assert_eq!(validate_file_component(name, "name", 64).is_ok(), ok, "{:?}", name);
        }
        assert!(validate_file_component(&"x".repeat(65), "name", 64).is_err());
    }

    #[test]
    fn test_validate_run_frame() {
        let mut frame = RunFrame {
            frame_id: "f1".into(),
            job_name: "job".into(),
            frame_name: "0001-render".into(),
            command: "echo hi".into(),
            user_name: "artist".into(),
            log_dir: "/shots/logs".into(),
            uid: 1000,
            num_cores: 100,
            ..Default::default()
        };
        validate_run_frame(&frame).unwrap();

        frame.log_dir = "relative/logs".into();
        assert!(validate_run_frame(&frame).is_err());

        frame.log_dir = "/shots/logs".into();
        frame.command = "   ".into();
        assert!(validate_run_frame(&frame).is_err());
    }
}
