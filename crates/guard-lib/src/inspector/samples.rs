//! Pod samples and the health verdict
//!
//! A workload is unhealthy when any of its pods is `Failed` or `Unknown`, or
//! any of its containers is waiting in `CrashLoopBackOff`. Restart counts,
//! pending time and resource usage are collected alongside but do not
//! influence the verdict.

use crate::models::{
    PodMetricRecord, PodPhase, PodRecord, PodSample, Verdict, CRASH_LOOP_BACK_OFF,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Build the per-tick sample for one pod
pub fn build_sample(
    pod: &PodRecord,
    metrics: Option<&PodMetricRecord>,
    now: DateTime<Utc>,
) -> PodSample {
    let restart_count = pod
        .containers
        .iter()
        .fold(0u32, |acc, c| acc.saturating_add(c.restart_count));

    let crash_loop = pod
        .containers
        .iter()
        .any(|c| c.waiting_reason.as_deref() == Some(CRASH_LOOP_BACK_OFF));

    let pending_duration = match (pod.phase, pod.created_at) {
        (PodPhase::Pending, Some(created)) => (now - created).to_std().ok(),
        _ => None,
    };

    // Usage is advisory; the first container stands in for the pod
    let usage = metrics.and_then(|m| m.containers.first());

    PodSample {
        pod_name: pod.name.clone(),
        namespace: pod.namespace.clone(),
        phase: pod.phase,
        restart_count,
        crash_loop,
        pending_duration,
        cpu_usage: usage.map(|u| u.cpu.clone()),
        memory_usage: usage.map(|u| u.memory.clone()),
    }
}

/// Verdict for the pods of one workload. No pods means healthy.
pub fn evaluate<'a, I>(samples: I) -> Verdict
where
    I: IntoIterator<Item = &'a PodSample>,
{
    let unhealthy = samples.into_iter().any(|s| {
        matches!(s.phase, PodPhase::Failed | PodPhase::Unknown) || s.crash_loop
    });

    if unhealthy {
        Verdict::Unhealthy
    } else {
        Verdict::Healthy
    }
}

/// Samples of one namespace, indexed by the job selector label value
#[derive(Debug, Default)]
pub struct SampleSet {
    by_job: HashMap<String, Vec<PodSample>>,
}

impl SampleSet {
    /// Index pods by `label_key`. Pods without the label are dropped.
    pub fn build(
        pods: &[PodRecord],
        metrics: &[PodMetricRecord],
        label_key: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let usage: HashMap<&str, &PodMetricRecord> = metrics
            .iter()
            .map(|m| (m.pod_name.as_str(), m))
            .collect();

        let mut by_job: HashMap<String, Vec<PodSample>> = HashMap::new();
        for pod in pods {
            let Some(job) = pod.labels.get(label_key) else {
                continue;
            };
            let sample = build_sample(pod, usage.get(pod.name.as_str()).copied(), now);
            by_job.entry(job.clone()).or_default().push(sample);
        }

        Self { by_job }
    }

    pub fn for_job(&self, job: &str) -> &[PodSample] {
        self.by_job.get(job).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn verdict_for(&self, job: &str) -> Verdict {
        evaluate(self.for_job(job))
    }

    pub fn job_count(&self) -> usize {
        self.by_job.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerRecord, ContainerUsage};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn pod(name: &str, job: Option<&str>, phase: PodPhase, waiting: Option<&str>) -> PodRecord {
        let mut labels = BTreeMap::new();
        if let Some(job) = job {
            labels.insert("job-name".to_string(), job.to_string());
        }
        PodRecord {
            name: name.to_string(),
            namespace: "default".to_string(),
            phase,
            labels,
            created_at: Some(Utc::now() - chrono::Duration::seconds(90)),
            containers: vec![
                ContainerRecord {
                    name: "main".to_string(),
                    restart_count: 2,
                    waiting_reason: waiting.map(str::to_string),
                },
                ContainerRecord {
                    name: "sidecar".to_string(),
                    restart_count: 1,
                    waiting_reason: None,
                },
            ],
        }
    }

    const ALL_PHASES: [PodPhase; 5] = [
        PodPhase::Pending,
        PodPhase::Running,
        PodPhase::Succeeded,
        PodPhase::Failed,
        PodPhase::Unknown,
    ];

    #[test]
    fn test_restart_count_summed_and_crash_loop_flagged() {
        let sample = build_sample(
            &pod("p", Some("etl-job"), PodPhase::Running, Some("CrashLoopBackOff")),
            None,
            Utc::now(),
        );
        assert_eq!(sample.restart_count, 3);
        assert!(sample.crash_loop);
        assert_eq!(sample.pending_duration, None);
    }

    #[test]
    fn test_pending_duration_only_while_pending() {
        let now = Utc::now();
        let pending = build_sample(&pod("p", None, PodPhase::Pending, None), None, now);
        assert!(pending.pending_duration.unwrap() >= Duration::from_secs(89));

        let running = build_sample(&pod("p", None, PodPhase::Running, None), None, now);
        assert_eq!(running.pending_duration, None);
    }

    #[test]
    fn test_usage_joined_by_pod_name() {
        let metrics = vec![PodMetricRecord {
            pod_name: "etl-1".to_string(),
            namespace: "default".to_string(),
            containers: vec![ContainerUsage {
                name: "main".to_string(),
                cpu: "50m".to_string(),
                memory: "128Mi".to_string(),
            }],
        }];
        let pods = vec![
            pod("etl-1", Some("etl-job"), PodPhase::Running, None),
            pod("etl-2", Some("etl-job"), PodPhase::Running, None),
        ];

        let set = SampleSet::build(&pods, &metrics, "job-name", Utc::now());
        let samples = set.for_job("etl-job");
        assert_eq!(samples.len(), 2);

        let first = samples.iter().find(|s| s.pod_name == "etl-1").unwrap();
        assert_eq!(first.cpu_usage.as_deref(), Some("50m"));
        assert_eq!(first.memory_usage.as_deref(), Some("128Mi"));
        let second = samples.iter().find(|s| s.pod_name == "etl-2").unwrap();
        assert_eq!(second.cpu_usage, None);
    }

    #[test]
    fn test_healthy_phases_without_crash_loop_are_healthy() {
        for phase in [PodPhase::Pending, PodPhase::Running, PodPhase::Succeeded] {
            for count in 0..4 {
                let pods: Vec<_> = (0..count)
                    .map(|i| {
                        let name = format!("p{}", i);
                        pod(&name, Some("etl-job"), phase, Some("ContainerCreating"))
                    })
                    .collect();
                let set = SampleSet::build(&pods, &[], "job-name", Utc::now());
                assert_eq!(
                    set.verdict_for("etl-job"),
                    Verdict::Healthy,
                    "{:?} x{}",
                    phase,
                    count
                );
            }
        }
    }

    #[test]
    fn test_any_bad_pod_makes_workload_unhealthy() {
        for bad_phase in [PodPhase::Failed, PodPhase::Unknown] {
            for healthy_phase in [PodPhase::Pending, PodPhase::Running, PodPhase::Succeeded] {
                let pods = vec![
                    pod("ok", Some("etl-job"), healthy_phase, None),
                    pod("bad", Some("etl-job"), bad_phase, None),
                ];
                let set = SampleSet::build(&pods, &[], "job-name", Utc::now());
                assert_eq!(set.verdict_for("etl-job"), Verdict::Unhealthy);
            }
        }

        for phase in ALL_PHASES {
            let pods = vec![pod("p", Some("etl-job"), phase, Some(CRASH_LOOP_BACK_OFF))];
            let set = SampleSet::build(&pods, &[], "job-name", Utc::now());
            assert_eq!(set.verdict_for("etl-job"), Verdict::Unhealthy);
        }
    }

    #[test]
    fn test_other_jobs_do_not_affect_verdict() {
        let pods = vec![
            pod("etl", Some("etl-job"), PodPhase::Running, None),
            pod("other", Some("other-job"), PodPhase::Failed, None),
            pod("unlabelled", None, PodPhase::Unknown, None),
        ];
        let set = SampleSet::build(&pods, &[], "job-name", Utc::now());

        assert_eq!(set.verdict_for("etl-job"), Verdict::Healthy);
        assert_eq!(set.verdict_for("other-job"), Verdict::Unhealthy);
        assert_eq!(set.verdict_for("missing-job"), Verdict::Healthy);
        assert_eq!(set.job_count(), 2);
    }

    #[test]
    fn test_label_key_is_configurable() {
        let mut custom = pod("p", None, PodPhase::Failed, None);
        custom
            .labels
            .insert("app.kubernetes.io/job".to_string(), "etl-job".to_string());

        let set = SampleSet::build(&[custom], &[], "app.kubernetes.io/job", Utc::now());
        assert_eq!(set.verdict_for("etl-job"), Verdict::Unhealthy);
    }
}
