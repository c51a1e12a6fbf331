//! 行协议控制面 (Line control protocol)
//!
//! 每行一条命令, 每条命令一行JSON应答

use serde_json::{json, Value};

use crate::error::{Result, StreamError};
use crate::params::ParamsUpdate;
use crate::pipeline::PipelineController;

/// 控制命令
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Start(String),
    Stop,
    Params(ParamsUpdate),
    Get,
    Models,
    Model(String),
    Status,
    Quit,
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StreamError::InvalidArgument(format!("invalid value for {}: {}", key, value)))
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match cmd.to_ascii_lowercase().as_str() {
            "start" => Ok(ControlCommand::Start(rest.to_string())),
            "stop" => Ok(ControlCommand::Stop),
            "get" => Ok(ControlCommand::Get),
            "models" => Ok(ControlCommand::Models),
            "model" => Ok(ControlCommand::Model(rest.to_string())),
            "status" => Ok(ControlCommand::Status),
            "quit" | "exit" => Ok(ControlCommand::Quit),
            "params" => {
                let mut update = ParamsUpdate::default();
                for pair in rest.split_whitespace() {
                    let (key, value) = pair.split_once('=').ok_or_else(|| {
                        StreamError::InvalidArgument(format!("expected key=value, got {}", pair))
                    })?;
                    match key {
                        "conf" => update.confidence = Some(parse_value(key, value)?),
                        "iou" => update.iou = Some(parse_value(key, value)?),
                        "line_width" => update.line_width = Some(parse_value(key, value)?),
                        "fps" => update.fps = Some(parse_value(key, value)?),
                        other => {
                            return Err(StreamError::InvalidArgument(format!(
                                "unknown parameter: {}",
                                other
                            )))
                        }
                    }
                }
                Ok(ControlCommand::Params(update))
            }
            "" => Err(StreamError::InvalidArgument("empty command".to_string())),
            other => Err(StreamError::InvalidArgument(format!("unknown command: {}", other))),
        }
    }
}

pub fn error_reply(e: &StreamError) -> Value {
    json!({
        "status": "error",
        "kind": e.kind(),
        "message": e.to_string(),
    })
}

fn execute(controller: &PipelineController, command: &ControlCommand) -> Result<Value> {
    match command {
        ControlCommand::Start(uri) => {
            controller.start(uri)?;
            Ok(json!({"status": "success", "message": "Stream started successfully!"}))
        }
        ControlCommand::Stop => {
            controller.stop()?;
            Ok(json!({"status": "success", "message": "Stream stopped successfully!"}))
        }
        ControlCommand::Params(update) => {
            let p = controller.update_params(*update)?;
            Ok(json!({
                "status": "success",
                "conf": p.confidence,
                "iou": p.iou,
                "line_width": p.line_width,
                "fps": p.fps,
            }))
        }
        ControlCommand::Get => Ok(serde_json::to_value(controller.params()).unwrap_or(Value::Null)),
        ControlCommand::Models => Ok(serde_json::to_value(controller.models()?).unwrap_or(Value::Null)),
        ControlCommand::Model(name) => {
            controller.switch_model(name)?;
            Ok(json!({"status": "success", "message": format!("Model changed to {}", name)}))
        }
        ControlCommand::Status => Ok(serde_json::to_value(controller.status()).unwrap_or(Value::Null)),
        ControlCommand::Quit => Ok(json!({"status": "success", "message": "bye"})),
    }
}

/// 执行一条命令, 错误也转成JSON应答
pub fn dispatch(controller: &PipelineController, command: &ControlCommand) -> Value {
    execute(controller, command).unwrap_or_else(|e| error_reply(&e))
}

/// 解析并执行一行; 返回应答和是否结束会话
pub fn handle_line(controller: &PipelineController, line: &str) -> (Value, bool) {
    match ControlCommand::parse(line) {
        Ok(command) => {
            let quit = command == ControlCommand::Quit;
            (dispatch(controller, &command), quit)
        }
        Err(e) => (error_reply(&e), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            ControlCommand::parse("start rtsp://cam/1?a=b c").unwrap(),
            ControlCommand::Start("rtsp://cam/1?a=b c".to_string())
        );
        assert_eq!(ControlCommand::parse("  STOP ").unwrap(), ControlCommand::Stop);
        assert_eq!(ControlCommand::parse("start").unwrap(), ControlCommand::Start(String::new()));
        assert_eq!(
            ControlCommand::parse("model yolo11n.pt").unwrap(),
            ControlCommand::Model("yolo11n.pt".to_string())
        );
        assert_eq!(ControlCommand::parse("quit").unwrap(), ControlCommand::Quit);
    }

    #[test]
    fn test_parse_params() {
        let cmd = ControlCommand::parse("params conf=0.3 fps=15").unwrap();
        assert_eq!(
            cmd,
            ControlCommand::Params(ParamsUpdate {
                confidence: Some(0.3),
                fps: Some(15),
                ..Default::default()
            })
        );
        assert_eq!(
            ControlCommand::parse("params").unwrap(),
            ControlCommand::Params(ParamsUpdate::default())
        );
    }

    #[test]
    fn test_parse_errors() {
        for line in ["", "jump", "params conf", "params conf=abc", "params gamma=1", "params fps=-1"] {
            let err = ControlCommand::parse(line).unwrap_err();
            assert_eq!(err.kind(), "InvalidArgument", "line {:?}", line);
        }
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = error_reply(&StreamError::NotFound("model x.pt".into()));
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["kind"], "NotFound");
        assert_eq!(reply["message"], "not found: model x.pt");
    }
}
