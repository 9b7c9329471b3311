use crate::{
    capsule::CALL_FILE,
    config::{fallback_partition, fallback_time, is_valid_time, TaskConfig},
    session::quote_path,
    worker::RUN_CAPSULE,
};
use tracing::warn;

/// name of the rendered script inside a workspace
pub const JOB_SCRIPT: &str = "job.sh";
/// file the scheduler writes the job's stdout and stderr into
pub const JOB_OUTPUT: &str = "job.out";

/// Resource request of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResources {
    pub partition: String,
    pub time: String,
    pub job_name: String,
    pub directives: Vec<String>,
}

impl JobResources {
    /// Take the request from `config`, replacing unusable values with the defaults.
    pub fn from_config(config: &TaskConfig, job_name: &str) -> Self {
        let partition = match config.partition.trim() {
            "" => {
                warn!("Empty partition, using '{}'", fallback_partition());
                fallback_partition()
            }
            partition => partition.to_string(),
        };

        let time = if is_valid_time(config.time.trim()) {
            config.time.trim().to_string()
        } else {
            warn!(
                "Time limit '{}' is not HH:MM:SS, using '{}'",
                config.time,
                fallback_time()
            );
            fallback_time()
        };

        Self {
            partition,
            time,
            job_name: job_name.to_string(),
            directives: config.directives.clone(),
        }
    }
}

impl Default for JobResources {
    fn default() -> Self {
        Self {
            partition: fallback_partition(),
            time: fallback_time(),
            job_name: String::from("remote"),
            directives: Vec::new(),
        }
    }
}

/// command line that runs the capsule inside the workspace
pub fn invocation(runner: &str) -> String {
    format!("{} {RUN_CAPSULE} {CALL_FILE}", runner.trim())
}

/// Render the batch script for one submission. Pure, identical input gives identical text.
pub fn render(
    resources: &JobResources,
    remote_path: &str,
    bootstrap: &[String],
    invocation: &str,
) -> String {
    let mut script = String::from("#!/bin/bash\n");

    script.push_str(&format!("#SBATCH --job-name={}\n", resources.job_name));
    script.push_str(&format!("#SBATCH --partition={}\n", resources.partition));
    script.push_str(&format!("#SBATCH --time={}\n", resources.time));
    for directive in &resources.directives {
        let directive = directive.trim();
        let directive = directive.strip_prefix("#SBATCH").map_or(directive, str::trim_start);
        script.push_str(&format!("#SBATCH {directive}\n"));
    }

    script.push_str("\nset -e\n");
    script.push_str(&format!("cd {}\n", quote_path(remote_path)));

    for line in bootstrap {
        script.push_str(line);
        script.push('\n');
    }

    script.push_str("echo \"Running\"\n");
    script.push_str(invocation);
    script.push('\n');

    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_directives_bootstrap_and_invocation() {
        let resources = JobResources {
            partition: String::from("cpu"),
            time: String::from("01:00:00"),
            job_name: String::from("greet"),
            directives: vec![String::from("--mem=4G"), String::from("#SBATCH --cpus-per-task=2")],
        };

        let script = render(
            &resources,
            "~/remote_jobs/greet_1700000000",
            &[String::from("module load rust")],
            &invocation("./target/release/demo"),
        );

        assert_eq!(
            script,
            "#!/bin/bash\n\
             #SBATCH --job-name=greet\n\
             #SBATCH --partition=cpu\n\
             #SBATCH --time=01:00:00\n\
             #SBATCH --mem=4G\n\
             #SBATCH --cpus-per-task=2\n\
             \n\
             set -e\n\
             cd ~/remote_jobs/greet_1700000000\n\
             module load rust\n\
             echo \"Running\"\n\
             ./target/release/demo run-capsule call.yaml\n"
        );
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = TaskConfig {
            partition: String::from("  "),
            time: String::from("ten minutes"),
            ..TaskConfig::default()
        };

        let resources = JobResources::from_config(&config, "add");

        assert_eq!(resources.partition, "short");
        assert_eq!(resources.time, "00:10:00");
        assert_eq!(resources.job_name, "add");
    }

    #[test]
    fn rendering_is_deterministic() {
        let resources = JobResources::default();
        let render_once = || render(&resources, "/scratch/add_1", &[], "run");

        assert_eq!(render_once(), render_once());
        assert!(render_once().contains("#SBATCH --partition=short\n#SBATCH --time=00:10:00\n"));
    }
}
