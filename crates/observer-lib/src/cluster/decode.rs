//! Decoding of Tekton custom resources from their JSON representation

use super::{PIPELINE_LABEL, PIPELINE_RUN_LABEL, PIPELINE_TASK_LABEL};
use crate::error::ClusterError;
use crate::models::{PipelineRunInfo, ResourceRequests, RunKey, RunStatus, TaskRunInfo};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Quantity suffixes, binary ones first so `Mi` wins over `M`
const BINARY_SUFFIXES: &[(&str, i32)] = &[
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

/// Decimal suffixes as powers of ten
const DECIMAL_SUFFIXES: &[(&str, i32)] = &[
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Parse a Kubernetes resource quantity such as `500m`, `2`, or `1Gi`
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(value) = raw.strip_suffix(suffix).and_then(|n| n.parse::<f64>().ok()) {
            return Some(value * 2f64.powi(*power));
        }
    }

    for (suffix, exponent) in DECIMAL_SUFFIXES {
        if let Some(value) = raw.strip_suffix(suffix).and_then(|n| n.parse::<f64>().ok()) {
            // Divide for sub-unit suffixes so `500m` is exactly 0.5
            return Some(if *exponent < 0 {
                value / 10f64.powi(-exponent)
            } else {
                value * 10f64.powi(*exponent)
            });
        }
    }

    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Decode a `tekton.dev/v1` PipelineRun
pub fn decode_pipeline_run(obj: &Value) -> Result<PipelineRunInfo, ClusterError> {
    let (namespace, name) = object_identity(obj, "PipelineRun")?;
    let labels = &obj["metadata"]["labels"];

    let pipeline = labels[PIPELINE_LABEL]
        .as_str()
        .or_else(|| obj["spec"]["pipelineRef"]["name"].as_str())
        .unwrap_or(&name)
        .to_string();

    let status = &obj["status"];
    let start_time = timestamp(&status["startTime"]);
    let completion_time = timestamp(&status["completionTime"]);

    let pipeline_spec = if status["pipelineSpec"].is_object() {
        &status["pipelineSpec"]
    } else {
        &obj["spec"]["pipelineSpec"]
    };

    let storage_request_bytes = obj["spec"]["workspaces"]
        .as_array()
        .map(|workspaces| {
            workspaces
                .iter()
                .filter_map(|ws| {
                    ws["volumeClaimTemplate"]["spec"]["resources"]["requests"]["storage"]
                        .as_str()
                        .and_then(parse_quantity)
                })
                .sum()
        })
        .unwrap_or(0.0);

    Ok(PipelineRunInfo {
        key: RunKey::new(namespace, name),
        uid: obj["metadata"]["uid"].as_str().unwrap_or_default().to_string(),
        pipeline,
        status: condition_status(status, start_time.is_some()),
        start_time,
        completion_time,
        declared_dependencies: declared_dependencies(pipeline_spec),
        storage_request_bytes,
    })
}

/// Decode a `tekton.dev/v1` TaskRun
pub fn decode_task_run(obj: &Value) -> Result<TaskRunInfo, ClusterError> {
    let (namespace, name) = object_identity(obj, "TaskRun")?;
    let labels = &obj["metadata"]["labels"];
    let status = &obj["status"];
    let start_time = timestamp(&status["startTime"]);

    Ok(TaskRunInfo {
        namespace,
        name,
        pipeline_run: labels[PIPELINE_RUN_LABEL].as_str().map(String::from),
        pipeline_task: labels[PIPELINE_TASK_LABEL].as_str().map(String::from),
        status: condition_status(status, start_time.is_some()),
        start_time,
        completion_time: timestamp(&status["completionTime"]),
        pod_name: status["podName"]
            .as_str()
            .filter(|p| !p.is_empty())
            .map(String::from),
        requests: step_requests(&status["taskSpec"]),
    })
}

fn object_identity(obj: &Value, kind: &'static str) -> Result<(String, String), ClusterError> {
    let meta = &obj["metadata"];
    match (meta["namespace"].as_str(), meta["name"].as_str()) {
        (Some(ns), Some(name)) => Ok((ns.to_string(), name.to_string())),
        _ => Err(ClusterError::Decode {
            kind,
            reason: "missing metadata.namespace or metadata.name".to_string(),
        }),
    }
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Map the `Succeeded` condition onto a run status
fn condition_status(status: &Value, started: bool) -> RunStatus {
    let condition = status["conditions"]
        .as_array()
        .and_then(|conds| conds.iter().find(|c| c["type"] == "Succeeded"));

    match condition.and_then(|c| c["status"].as_str()) {
        Some("True") => RunStatus::Succeeded,
        Some("False") => RunStatus::Failed,
        _ if started => RunStatus::Running,
        _ => RunStatus::Unknown,
    }
}

/// `runAfter` edges of the pipeline's tasks; finally tasks follow every task
fn declared_dependencies(spec: &Value) -> Option<BTreeMap<String, Vec<String>>> {
    let tasks = spec["tasks"].as_array()?;
    let mut deps = BTreeMap::new();

    for task in tasks {
        let Some(name) = task["name"].as_str() else {
            continue;
        };
        let run_after = task["runAfter"]
            .as_array()
            .map(|after| {
                after
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        deps.insert(name.to_string(), run_after);
    }

    let regular: Vec<String> = deps.keys().cloned().collect();
    if let Some(finally) = spec["finally"].as_array() {
        for task in finally {
            if let Some(name) = task["name"].as_str() {
                deps.insert(name.to_string(), regular.clone());
            }
        }
    }

    Some(deps)
}

/// Sum of step requests declared in a resolved task spec
fn step_requests(task_spec: &Value) -> ResourceRequests {
    let mut requests = ResourceRequests::default();
    let Some(steps) = task_spec["steps"].as_array() else {
        return requests;
    };

    for step in steps {
        let declared = if step["computeResources"].is_object() {
            &step["computeResources"]["requests"]
        } else {
            &step["resources"]["requests"]
        };
        if let Some(cpu) = declared["cpu"].as_str().and_then(parse_quantity) {
            requests.cpu_cores += cpu;
        }
        if let Some(memory) = declared["memory"].as_str().and_then(parse_quantity) {
            requests.memory_bytes += memory;
        }
    }

    requests
}
