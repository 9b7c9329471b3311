use crate::{
    capsule::{outcome::Outcome, CallCapsule},
    config::TaskConfig,
    error_chain,
    task::{Task, TaskFn},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::{type_name, Any},
    collections::BTreeMap,
    fmt::{self, Debug, Display},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, warn};

type Invoker = Box<dyn Fn(&CallCapsule) -> Outcome + Send + Sync>;

/// Maps stable task names to the code that runs them.
///
/// The same registry has to be compiled into the binary that runs on the remote
/// host, capsules only carry the name.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Invoker>,
}

impl Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` under `name`, replacing any previous registration.
    pub fn register<A, R, E, F>(&mut self, name: impl Into<String>, func: F)
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: Display + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        self.insert(name.into(), invoker::<A, R, E>(Arc::new(func)));
    }

    /// Register `func` under `name` and return a callable handle for it.
    pub fn task<A, R, E, F>(&mut self, name: &str, config: TaskConfig, func: F) -> Task<A, R, E>
    where
        A: Serialize + DeserializeOwned + 'static,
        R: Serialize + DeserializeOwned + 'static,
        E: Display + 'static,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let func: TaskFn<A, R, E> = Arc::new(func);
        self.insert(name.to_string(), invoker(func.clone()));

        Task::new(name, config, func)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Run the call held by `capsule`. Panics inside the task are reported as raised errors.
    pub fn invoke(&self, capsule: &CallCapsule) -> Outcome {
        let Some(invoker) = self.tasks.get(capsule.target()) else {
            return Outcome::Rejected {
                reason: format!("no task is registered as '{}'", capsule.target()),
            };
        };

        debug!(task = capsule.target(), "Invoking task");

        catch_unwind(AssertUnwindSafe(|| invoker(capsule))).unwrap_or_else(|payload| {
            Outcome::Raised {
                kind: String::from("panic"),
                message: panic_message(payload),
            }
        })
    }

    fn insert(&mut self, name: String, invoker: Invoker) {
        if self.tasks.insert(name.clone(), invoker).is_some() {
            warn!(name = %name, "Task was registered twice, keeping the last registration");
        }
    }
}

fn invoker<A, R, E>(func: TaskFn<A, R, E>) -> Invoker
where
    A: DeserializeOwned + 'static,
    R: Serialize + 'static,
    E: Display + 'static,
{
    Box::new(move |capsule: &CallCapsule| {
        let arguments = match capsule.arguments().decode::<A>() {
            Ok(arguments) => arguments,
            Err(error) => {
                return Outcome::Rejected {
                    reason: error_chain(&error),
                }
            }
        };

        match func(arguments) {
            Ok(value) => match serde_yaml::to_value(value) {
                Ok(value) => Outcome::Returned { value },
                Err(error) => Outcome::Raised {
                    kind: String::from(type_name::<serde_yaml::Error>()),
                    message: format!("return value could not be serialized: {error}"),
                },
            },
            Err(error) => Outcome::Raised {
                kind: String::from(type_name::<E>()),
                message: error.to_string(),
            },
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => String::from("task panicked with a non-string payload"),
        },
    }
}
