//! 工具契约：参数 schema 与调用时校验
//!
//! ToolSpec 描述工具名、描述与有序参数表；validate_arguments 在调用时逐个检查
//! 必填项与基本类型，返回结构化的 SchemaError，而不是依赖隐式类型转换。
//! 参数表可以手写，也可以用 schemars 从参数结构体派生（ToolSpec::from_args）。

use schemars::schema::{InstanceType, RootSchema, Schema, SingleOrVec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// 参数基本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        }
    }

    /// 值是否属于该类型（integer 只接受整数，number 接受任意数值）
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
        }
    }

    fn from_instance_type(ty: &InstanceType) -> Option<Self> {
        match ty {
            InstanceType::String => Some(ParamType::String),
            InstanceType::Integer => Some(ParamType::Integer),
            InstanceType::Number => Some(ParamType::Number),
            InstanceType::Boolean => Some(ParamType::Boolean),
            _ => None,
        }
    }
}

/// 单个参数声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            description: description.into(),
        }
    }
}

/// 工具声明：注册后不可变，进程生命周期内有效
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParamSpec>,
}

/// 参数校验失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(String),

    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    #[error("parameter '{name}' must be of type {expected}, got {actual}")]
    WrongType {
        name: String,
        expected: &'static str,
        actual: String,
    },

    #[error("cannot derive tool schema: {0}")]
    Unsupported(String),
}

fn json_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "boolean".into(),
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer".into(),
        Value::Number(_) => "number".into(),
        Value::String(_) => "string".into(),
        Value::Array(_) => "array".into(),
        Value::Object(_) => "object".into(),
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.parameters.push(param);
        self
    }

    /// 从参数结构体的 JsonSchema 派生参数表：字段文档注释即参数描述，Option 字段为可选
    pub fn from_args<T: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, SchemaError> {
        let root = schemars::schema_for!(T);
        Ok(Self {
            name: name.into(),
            description: description.into(),
            parameters: params_from_root(&root)?,
        })
    }

    pub fn get_param(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// 校验模型给出的参数；null 视为未提供，未声明的多余键忽略
    pub fn validate_arguments(&self, args: &Value) -> Result<(), SchemaError> {
        let obj = match args {
            Value::Object(map) => map,
            // 无参数工具允许模型省略参数
            Value::Null if self.parameters.iter().all(|p| !p.required) => return Ok(()),
            other => return Err(SchemaError::NotAnObject(json_type_name(other))),
        };
        for param in &self.parameters {
            match obj.get(&param.name) {
                None | Some(Value::Null) => {
                    if param.required {
                        return Err(SchemaError::MissingParameter(param.name.clone()));
                    }
                }
                Some(value) => {
                    if !param.ty.accepts(value) {
                        return Err(SchemaError::WrongType {
                            name: param.name.clone(),
                            expected: param.ty.as_str(),
                            actual: json_type_name(value),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// OpenAI function-calling 格式的参数 JSON Schema
    pub fn parameters_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                json!({ "type": p.ty.as_str(), "description": p.description }),
            );
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn params_from_root(root: &RootSchema) -> Result<Vec<ParamSpec>, SchemaError> {
    let Some(object) = root.schema.object.as_ref() else {
        return Ok(Vec::new());
    };
    let mut params = Vec::with_capacity(object.properties.len());
    for (name, schema) in &object.properties {
        let Schema::Object(prop) = schema else {
            return Err(SchemaError::Unsupported(format!("property '{name}' has boolean schema")));
        };
        let ty = match &prop.instance_type {
            Some(SingleOrVec::Single(t)) => ParamType::from_instance_type(t),
            // Option<T> 展开为 [T, null]
            Some(SingleOrVec::Vec(types)) => types.iter().find_map(ParamType::from_instance_type),
            None => None,
        }
        .ok_or_else(|| SchemaError::Unsupported(format!("property '{name}' is not a primitive")))?;
        let description = prop
            .metadata
            .as_ref()
            .and_then(|m| m.description.clone())
            .unwrap_or_default();
        params.push(ParamSpec {
            name: name.clone(),
            ty,
            required: object.required.contains(name),
            description,
        });
    }
    Ok(params)
}
