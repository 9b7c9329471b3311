//! The call capsule: a write-once snapshot of a deferred invocation.
//!
//! A capsule names its target by the identity the task was registered under and
//! carries the arguments as YAML values. Positional arguments come from anything
//! serializing to a sequence (tuples), keyword arguments from anything serializing
//! to a mapping with string keys (structs). Any other value, including a map keyed
//! by numbers, travels as a single positional argument.

pub mod outcome;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::{
    collections::BTreeMap,
    fs, io,
    path::Path,
    str::{self, Utf8Error},
};
use thiserror::Error;

/// name of the capsule inside a remote workspace
pub const CALL_FILE: &str = "call.yaml";

/// last line of every encoded capsule, a missing trailer means the stream was cut short
const TRAILER: &str = "# end of call capsule\n";

#[derive(Error, Debug)]
pub enum CapsuleError {
    #[error("Failed to serialize the call arguments")]
    Encode(#[source] serde_yaml::Error),
    #[error("Capsule is not valid UTF-8")]
    NotUtf8(#[from] Utf8Error),
    #[error("Capsule is truncated")]
    Truncated,
    #[error("Capsule could not be decoded")]
    Decode(#[source] serde_yaml::Error),
    #[error("Arguments do not match what the task expects")]
    Arguments(#[source] serde_yaml::Error),
    #[error("Task expects a single argument value but the call mixes positional and keyword arguments")]
    MixedArguments,
    #[error("Failed to access capsule file")]
    Io(#[from] io::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CallCapsule {
    target: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: BTreeMap<String, Value>,
}

impl CallCapsule {
    /// Capture a call of `target` with `arguments`.
    pub fn new<A: Serialize>(target: impl Into<String>, arguments: &A) -> Result<Self, CapsuleError> {
        let (args, kwargs) = match serde_yaml::to_value(arguments).map_err(CapsuleError::Encode)? {
            Value::Null => (Vec::new(), BTreeMap::new()),
            Value::Sequence(args) => (args, BTreeMap::new()),
            Value::Mapping(mapping) if is_keywords(&mapping) => (Vec::new(), keywords(mapping)),
            value => (vec![value], BTreeMap::new()),
        };

        Ok(Self::from_parts(target, args, kwargs))
    }

    pub fn from_parts(
        target: impl Into<String>,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            target: target.into(),
            args,
            kwargs,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    pub fn arguments(&self) -> Arguments<'_> {
        Arguments { capsule: self }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CapsuleError> {
        let mut encoded = serde_yaml::to_string(self).map_err(CapsuleError::Encode)?;
        encoded.push_str(TRAILER);

        Ok(encoded.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CapsuleError> {
        let body = str::from_utf8(bytes)?
            .strip_suffix(TRAILER)
            .ok_or(CapsuleError::Truncated)?;

        serde_yaml::from_str(body).map_err(CapsuleError::Decode)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), CapsuleError> {
        Ok(fs::write(path, self.encode()?)?)
    }

    pub fn read_from(path: &Path) -> Result<Self, CapsuleError> {
        Self::decode(&fs::read(path)?)
    }
}

fn is_keywords(mapping: &Mapping) -> bool {
    !mapping.is_empty() && mapping.keys().all(Value::is_string)
}

fn keywords(mapping: Mapping) -> BTreeMap<String, Value> {
    mapping
        .into_iter()
        .filter_map(|(key, value)| match key {
            Value::String(key) => Some((key, value)),
            _ => None,
        })
        .collect()
}

/// Typed view on the arguments of a capsule.
#[derive(Debug, Clone, Copy)]
pub struct Arguments<'a> {
    capsule: &'a CallCapsule,
}

impl Arguments<'_> {
    /// Decode all arguments as one value, the inverse of [`CallCapsule::new`].
    pub fn decode<A: DeserializeOwned>(&self) -> Result<A, CapsuleError> {
        let CallCapsule { args, kwargs, .. } = self.capsule;

        match (args.is_empty(), kwargs.is_empty()) {
            (true, true) => serde_yaml::from_value(Value::Null).map_err(CapsuleError::Arguments),
            (true, false) => serde_yaml::from_value(Value::Mapping(
                kwargs
                    .iter()
                    .map(|(key, value)| (Value::String(key.clone()), value.clone()))
                    .collect(),
            ))
            .map_err(CapsuleError::Arguments),
            (false, true) => match serde_yaml::from_value(Value::Sequence(args.clone())) {
                Ok(decoded) => Ok(decoded),
                // a lone scalar argument was captured as a single positional value
                Err(_) if args.len() == 1 => {
                    serde_yaml::from_value(args[0].clone()).map_err(CapsuleError::Arguments)
                }
                Err(error) => Err(CapsuleError::Arguments(error)),
            },
            (false, false) => Err(CapsuleError::MixedArguments),
        }
    }

    /// positional argument at `index`, `None` if there is none
    pub fn positional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, CapsuleError> {
        self.capsule
            .args
            .get(index)
            .map(|value| serde_yaml::from_value(value.clone()).map_err(CapsuleError::Arguments))
            .transpose()
    }

    /// keyword argument `name`, `None` if there is none
    pub fn keyword<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CapsuleError> {
        self.capsule
            .kwargs
            .get(name)
            .map(|value| serde_yaml::from_value(value.clone()).map_err(CapsuleError::Arguments))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Greeting {
        name: String,
        excited: bool,
    }

    #[test]
    fn tuple_becomes_positional() {
        let capsule = CallCapsule::new("add", &(2, 3)).unwrap();

        assert_eq!(capsule.target(), "add");
        assert_eq!(capsule.args(), &[Value::from(2), Value::from(3)]);
        assert!(capsule.kwargs().is_empty());
        assert_eq!(capsule.arguments().decode::<(i64, i64)>().unwrap(), (2, 3));
    }

    #[test]
    fn struct_becomes_keywords() {
        let greeting = Greeting {
            name: String::from("Ada"),
            excited: true,
        };
        let capsule = CallCapsule::new("greet", &greeting).unwrap();

        assert!(capsule.args().is_empty());
        assert_eq!(
            capsule.arguments().keyword::<String>("name").unwrap(),
            Some(String::from("Ada"))
        );
        assert_eq!(capsule.arguments().decode::<Greeting>().unwrap(), greeting);
    }

    #[test]
    fn scalar_and_unit_arguments() {
        let single = CallCapsule::new("greet", &"Ada").unwrap();
        assert_eq!(single.args().len(), 1);
        assert_eq!(single.arguments().decode::<String>().unwrap(), "Ada");

        let none = CallCapsule::new("noop", &()).unwrap();
        assert!(none.args().is_empty() && none.kwargs().is_empty());
        none.arguments().decode::<()>().unwrap();
    }

    #[test]
    fn maps_without_string_keys_stay_positional() {
        let weights = BTreeMap::from([(1_u32, 0.5), (7, 2.25)]);
        let capsule = CallCapsule::new("weigh", &weights).unwrap();

        assert_eq!(capsule.args().len(), 1);
        assert!(capsule.kwargs().is_empty());

        let decoded = CallCapsule::decode(&capsule.encode().unwrap()).unwrap();
        assert_eq!(
            decoded.arguments().decode::<BTreeMap<u32, f64>>().unwrap(),
            weights
        );

        let empty = CallCapsule::new("weigh", &BTreeMap::<String, f64>::new()).unwrap();
        assert!(empty
            .arguments()
            .decode::<BTreeMap<String, f64>>()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn round_trip_keeps_content() {
        let capsule = CallCapsule::from_parts(
            "mixed",
            vec![
                Value::from(1.5),
                Value::from("text"),
                Value::Null,
                serde_yaml::to_value(vec![1, 2, 3]).unwrap(),
            ],
            BTreeMap::from([
                (String::from("flag"), Value::from(false)),
                (
                    String::from("nested"),
                    serde_yaml::to_value(BTreeMap::from([("depth", 2)])).unwrap(),
                ),
            ]),
        );

        let decoded = CallCapsule::decode(&capsule.encode().unwrap()).unwrap();

        assert_eq!(decoded, capsule);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let encoded = CallCapsule::new("add", &(2, 3)).unwrap().encode().unwrap();

        assert!(matches!(
            CallCapsule::decode(&encoded[..encoded.len() - 4]),
            Err(CapsuleError::Truncated)
        ));
        assert!(matches!(
            CallCapsule::decode(&[0xff, 0xfe]),
            Err(CapsuleError::NotUtf8(_))
        ));
    }

    #[test]
    fn malformed_stream_is_a_decode_error() {
        let garbage = format!("target: [unclosed\n{TRAILER}");

        assert!(matches!(
            CallCapsule::decode(garbage.as_bytes()),
            Err(CapsuleError::Decode(_))
        ));
    }

    #[test]
    fn mixed_arguments_need_accessors() {
        let capsule = CallCapsule::from_parts(
            "greet",
            vec![Value::from("Ada")],
            BTreeMap::from([(String::from("excited"), Value::from(true))]),
        );

        assert!(matches!(
            capsule.arguments().decode::<Greeting>(),
            Err(CapsuleError::MixedArguments)
        ));
        assert_eq!(
            capsule.arguments().positional::<String>(0).unwrap().as_deref(),
            Some("Ada")
        );
        assert_eq!(capsule.arguments().keyword::<bool>("excited").unwrap(), Some(true));
        assert_eq!(capsule.arguments().positional::<String>(1).unwrap(), None);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CALL_FILE);
        let capsule = CallCapsule::new("add", &(2, 3)).unwrap();

        capsule.write_to(&path).unwrap();

        assert_eq!(CallCapsule::read_from(&path).unwrap(), capsule);
    }
}
