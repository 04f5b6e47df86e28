//! 工具调用契约（Schema → 校验后的参数）
//!
//! 远程工具只声明一份 JSON Schema，没有编译期类型。这里为每个工具构建一次 CallContract：
//! 每个属性一条 FieldSpec（名称 + 类型标签 + 是否必填 + 说明），调用时按契约把模型给出的参数
//! 校验/转换为 ValidatedArgs（小型键值表）。
//!
//! 规则：
//! - 未知或缺失的 type 按 string 处理
//! - 空 Schema 或非 object Schema 得到无字段契约（无参工具）
//! - 必填字段缺失（或为 null）报 ValidationError，可选字段缺失即缺省
//! - 契约之外的多余字段丢弃
//!
//! 本地工具用 schemars 从参数结构体生成 Schema（`schema_of`），与远程工具走同一条契约路径。

use std::collections::HashSet;
use std::fmt;

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

use crate::core::ValidationError;

/// 字段类型标签
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldKind {
    /// 解析 Schema 中的 type；数组形式（如 ["integer", "null"]）取第一个非 null 项
    fn from_schema_type(ty: Option<&Value>) -> Self {
        let name = match ty {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .find(|s| *s != "null"),
            _ => None,
        };
        match name {
            Some("integer") => FieldKind::Integer,
            Some("number") => FieldKind::Number,
            Some("boolean") => FieldKind::Boolean,
            Some("array") => FieldKind::Array,
            Some("object") => FieldKind::Object,
            _ => FieldKind::String,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }

    /// 将值转换为本类型；失败返回原因
    fn coerce(&self, value: &Value) -> Result<Value, String> {
        let fail = || format!("expected {}, got {}", self.as_str(), value_kind(value));
        match self {
            FieldKind::String => match value {
                Value::String(_) => Ok(value.clone()),
                // 标量无损转为字符串
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(fail()),
            },
            FieldKind::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                        Ok(Value::from(f as i64))
                    }
                    _ => Err(fail()),
                },
                Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| fail()),
                _ => Err(fail()),
            },
            FieldKind::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(fail),
                _ => Err(fail()),
            },
            FieldKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(fail()),
                },
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "yes" | "1" => Ok(Value::Bool(true)),
                    "false" | "no" | "0" => Ok(Value::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            FieldKind::Array => match value {
                Value::Array(_) => Ok(value.clone()),
                _ => Err(fail()),
            },
            FieldKind::Object => match value {
                Value::Object(_) => Ok(value.clone()),
                _ => Err(fail()),
            },
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 契约中的一个字段
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub description: Option<String>,
}

/// 一个工具的调用契约；构建一次后复用
#[derive(Clone, Debug, PartialEq)]
pub struct CallContract {
    tool: String,
    fields: Vec<FieldSpec>,
}

impl CallContract {
    /// 从工具声明的输入 Schema 构建契约
    pub fn from_schema(tool: impl Into<String>, schema: &Value) -> Self {
        let tool = tool.into();
        let Some(obj) = schema.as_object() else {
            return Self { tool, fields: Vec::new() };
        };
        let is_object = match obj.get("type") {
            None => obj.contains_key("properties"),
            Some(t) => FieldKind::from_schema_type(Some(t)) == FieldKind::Object,
        };
        let Some(props) = obj.get("properties").and_then(Value::as_object).filter(|_| is_object)
        else {
            return Self { tool, fields: Vec::new() };
        };

        let required: HashSet<&str> = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let fields = props
            .iter()
            .map(|(name, prop)| FieldSpec {
                name: name.clone(),
                kind: FieldKind::from_schema_type(prop.get("type")),
                // 也接受属性内联的 "required": true
                required: required.contains(name.as_str())
                    || prop.get("required").and_then(Value::as_bool).unwrap_or(false),
                description: prop
                    .get("description")
                    .and_then(Value::as_str)
                    .map(String::from),
            })
            .collect();

        Self { tool, fields }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    /// 按契约校验模型给出的参数
    pub fn validate(&self, raw: &Value) -> Result<ValidatedArgs, ValidationError> {
        let empty = Map::new();
        let parsed;
        let args = match raw {
            Value::Object(map) => map,
            Value::Null => &empty,
            // 模型偶尔把参数对象再编码成一层字符串
            Value::String(s) => {
                parsed = serde_json::from_str::<Value>(s).ok();
                match parsed.as_ref().and_then(Value::as_object) {
                    Some(map) => map,
                    None if s.trim().is_empty() => &empty,
                    None => {
                        return Err(ValidationError::new("$", "arguments must be a JSON object"))
                    }
                }
            }
            other => {
                return Err(ValidationError::new(
                    "$",
                    format!("arguments must be a JSON object, got {}", value_kind(other)),
                ))
            }
        };

        let mut out = Map::new();
        for field in &self.fields {
            match args.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(ValidationError::new(&field.name, "field required"));
                    }
                }
                Some(value) => {
                    let coerced = field
                        .kind
                        .coerce(value)
                        .map_err(|reason| ValidationError::new(&field.name, reason))?;
                    out.insert(field.name.clone(), coerced);
                }
            }
        }
        Ok(ValidatedArgs(out))
    }
}

/// 校验后的参数：字段名 → 已转换为声明类型的值；可选字段缺省时不出现
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidatedArgs(Map<String, Value>);

impl ValidatedArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// 由参数结构体生成工具输入 Schema（去掉 $schema / title 等模型无关的元字段）
pub fn schema_of<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.entry("properties")
            .or_insert_with(|| Value::Object(Map::new()));
    }
    value
}
