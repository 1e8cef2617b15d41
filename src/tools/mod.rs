pub mod calculator;
pub mod datetime;
pub mod executor;
pub mod notes;
pub mod registry;
pub mod schema;
pub mod search;
pub mod weather;

pub use calculator::CalculatorTool;
pub use datetime::DateTimeTool;
pub use executor::{ToolCallRequest, ToolErrorKind, ToolExecutor, ToolResult, ToolStatus};
pub use notes::{DeleteNoteTool, GetNotesTool, SaveNoteTool};
pub use registry::{Tool, ToolRegistry};
pub use schema::{ParamSpec, ParamType, SchemaError, ToolSpec};
pub use search::SearchTool;
pub use weather::WeatherTool;
