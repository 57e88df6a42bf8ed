//! 工具层：Tool trait、注册表、带超时与审计的执行器、控制类工具

pub mod control;
pub mod echo;
pub mod executor;
pub mod registry;

pub use control::{register_control_tools, EscalateTool, ExitLoopTool, RequestInputTool, TransferTool};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolError, ToolOutput, ToolRegistry};
