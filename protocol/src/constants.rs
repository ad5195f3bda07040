//! 协议常量定义

/// 协议版本号
pub const PROTOCOL_VERSION: u8 = 1;

/// 消息帧最大大小
pub const MAX_FRAME_SIZE: usize = 8192;

/// 用户名最大长度（字节）
pub const MAX_USERNAME_LEN: usize = 32;

/// 默认服务端端口
pub const DEFAULT_PORT: u16 = 8080;

/// 控制台提示符
pub const PROMPT: &str = "% ";

/// 握手成功时服务端回复的消息体
pub const CONNECT_OK: &str = "ok";

/// 在线用户列表为空时的标记
pub const EMPTY_ROSTER: &str = " (None)";

/// 在线用户列表标题
pub const ROSTER_HEADER: &str = "List of connected clients:";
