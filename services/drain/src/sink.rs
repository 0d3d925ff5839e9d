//! Sink writer for the time-series store.
//!
//! [`SinkWriter`] is the contract the drain engine writes against. The IoTDB
//! implementation talks to the REST API (`/rest/v2/insertRecords`) of one or
//! more nodes.

use crate::config::IotdbConfig;
use crate::error::SinkError;
use crate::record::TelemetryRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// How the engine hands decoded records to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// One write per record
    Single,
    /// One write per batch, split by device inside the sink
    #[default]
    Grouped,
}

/// Persists telemetry records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SinkWriter: Send + Sync {
    /// Persist one record
    async fn persist(&self, record: &TelemetryRecord) -> Result<(), SinkError>;

    /// Persist several records.
    ///
    /// Returns exactly one outcome per input record, in input order. When the
    /// underlying write covers several records at once, its outcome is
    /// repeated for each of them.
    async fn persist_many(&self, records: &[TelemetryRecord]) -> Vec<Result<(), SinkError>> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.persist(record).await);
        }
        outcomes
    }
}

/// IoTDB data types used by the telemetry measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Int64,
    Boolean,
    Double,
    Text,
}

/// A single timeseries row for one device
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub device: String,
    pub timestamp: i64,
    pub measurements: Vec<&'static str>,
    pub data_types: Vec<DataType>,
    pub values: Vec<Value>,
}

impl Row {
    fn push(&mut self, measurement: &'static str, data_type: DataType, value: Value) {
        self.measurements.push(measurement);
        self.data_types.push(data_type);
        self.values.push(value);
    }

    /// Build the row for a record; absent text fields are left out
    pub fn from_record(record: &TelemetryRecord, device_prefix: &str) -> Self {
        let mut row = Row {
            device: device_path(device_prefix, record.device_id),
            timestamp: record.fix_time,
            measurements: Vec::with_capacity(18),
            data_types: Vec::with_capacity(18),
            values: Vec::with_capacity(18),
        };

        row.push("id", DataType::Int64, record.id.into());
        row.push("deviceId", DataType::Int64, record.device_id.into());
        if let Some(protocol) = &record.protocol {
            row.push("protocol", DataType::Text, protocol.as_str().into());
        }
        row.push("serverTime", DataType::Int64, record.server_time.into());
        row.push("deviceTime", DataType::Int64, record.device_time.into());
        row.push("fixTime", DataType::Int64, record.fix_time.into());
        row.push("outdated", DataType::Boolean, record.outdated.into());
        row.push("valid", DataType::Boolean, record.valid.into());
        row.push("latitude", DataType::Double, record.latitude.into());
        row.push("longitude", DataType::Double, record.longitude.into());
        row.push("altitude", DataType::Double, record.altitude.into());
        row.push("speed", DataType::Double, record.speed.into());
        row.push("course", DataType::Double, record.course.into());
        if let Some(address) = &record.address {
            row.push("address", DataType::Text, address.as_str().into());
        }
        row.push("accuracy", DataType::Double, record.accuracy.into());
        if let Some(network) = &record.network {
            row.push("network", DataType::Text, network.as_str().into());
        }
        if let Some(packet_type) = &record.packet_type {
            row.push("packetType", DataType::Text, packet_type.as_str().into());
        }
        if let Some(unique_id) = &record.unique_id {
            row.push("uniqueId", DataType::Text, unique_id.as_str().into());
        }

        row
    }
}

/// Timeseries device path for a device id
pub fn device_path(prefix: &str, device_id: i64) -> String {
    format!("{}.d{}", prefix, device_id)
}

/// Body of `POST /rest/v2/insertRecords`
#[derive(Debug, Serialize, PartialEq)]
pub struct InsertRecordsRequest {
    pub devices: Vec<String>,
    pub timestamps: Vec<i64>,
    pub measurements_list: Vec<Vec<&'static str>>,
    pub data_types_list: Vec<Vec<DataType>>,
    pub values_list: Vec<Vec<Value>>,
    pub is_aligned: bool,
}

impl InsertRecordsRequest {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut request = InsertRecordsRequest {
            devices: Vec::with_capacity(rows.len()),
            timestamps: Vec::with_capacity(rows.len()),
            measurements_list: Vec::with_capacity(rows.len()),
            data_types_list: Vec::with_capacity(rows.len()),
            values_list: Vec::with_capacity(rows.len()),
            is_aligned: false,
        };

        for row in rows {
            request.devices.push(row.device);
            request.timestamps.push(row.timestamp);
            request.measurements_list.push(row.measurements);
            request.data_types_list.push(row.data_types);
            request.values_list.push(row.values);
        }

        request
    }
}

/// Status body returned by the IoTDB REST API
#[derive(Debug, Deserialize)]
struct ExecutionStatus {
    code: i64,
    #[serde(default)]
    message: String,
}

const IOTDB_SUCCESS: i64 = 200;

/// IoTDB sink over the REST API
pub struct IotdbSink {
    client: reqwest::Client,
    nodes: Vec<String>,
    username: String,
    password: String,
    device_prefix: String,
    next_node: AtomicUsize,
}

impl IotdbSink {
    /// Create a new IoTDB sink
    pub fn new(config: &IotdbConfig, request_timeout: Duration) -> Result<Self, SinkError> {
        if config.nodes.is_empty() {
            return Err(SinkError::Unreachable("no nodes configured".to_string()));
        }

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_size)
            .timeout(request_timeout)
            .build()
            .map_err(|e| SinkError::Transport {
                node: "client".to_string(),
                source: e,
            })?;

        let nodes = config
            .nodes
            .iter()
            .map(|n| n.trim_end_matches('/').to_string())
            .collect();

        Ok(Self {
            client,
            nodes,
            username: config.username.clone(),
            password: config.password.clone(),
            device_prefix: config.device_prefix.clone(),
            next_node: AtomicUsize::new(0),
        })
    }

    /// Insert rows, starting at a rotating node and falling over to the
    /// next one on transport errors only
    #[instrument(skip(self, request), fields(rows = request.timestamps.len()))]
    async fn insert_records(&self, request: &InsertRecordsRequest) -> Result<(), SinkError> {
        let start = self.next_node.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.nodes.len() {
            let node = &self.nodes[(start + offset) % self.nodes.len()];
            match self.post(node, request).await {
                Ok(()) => return Ok(()),
                Err(e @ SinkError::Transport { .. }) => {
                    warn!(node = %node, error = %e, "IoTDB node unreachable, trying next");
                    metrics::counter!("drain.sink.errors").increment(1);
                    last_error = Some(e);
                }
                Err(e) => {
                    metrics::counter!("drain.sink.errors").increment(1);
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SinkError::Unreachable("no nodes configured".to_string())))
    }

    async fn post(&self, node: &str, request: &InsertRecordsRequest) -> Result<(), SinkError> {
        let url = format!("{}/rest/v2/insertRecords", node);
        let transport = |e| SinkError::Transport {
            node: node.to_string(),
            source: e,
        };

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(request)
            .send()
            .await
            .map_err(transport)?;

        let http_status = response.status();
        let body = response.text().await.map_err(transport)?;
        let status: ExecutionStatus =
            serde_json::from_str(&body).map_err(|_| SinkError::Rejected {
                code: i64::from(http_status.as_u16()),
                message: body.clone(),
            })?;

        if !http_status.is_success() || status.code != IOTDB_SUCCESS {
            return Err(SinkError::Rejected {
                code: status.code,
                message: status.message,
            });
        }

        debug!(node = %node, rows = request.timestamps.len(), "Inserted rows");
        Ok(())
    }
}

#[async_trait]
impl SinkWriter for IotdbSink {
    async fn persist(&self, record: &TelemetryRecord) -> Result<(), SinkError> {
        let request =
            InsertRecordsRequest::from_rows(vec![Row::from_record(record, &self.device_prefix)]);
        self.insert_records(&request).await
    }

    async fn persist_many(&self, records: &[TelemetryRecord]) -> Vec<Result<(), SinkError>> {
        let groups = group_by_device(records);
        let mut outcomes: Vec<Option<Result<(), SinkError>>> =
            (0..records.len()).map(|_| None).collect();

        for (device_id, indexes) in groups {
            let rows = indexes
                .iter()
                .map(|&i| Row::from_record(&records[i], &self.device_prefix))
                .collect();
            let request = InsertRecordsRequest::from_rows(rows);

            match self.insert_records(&request).await {
                Ok(()) => {
                    for &i in &indexes {
                        outcomes[i] = Some(Ok(()));
                    }
                }
                Err(e) => {
                    warn!(
                        device_id,
                        records = indexes.len(),
                        error = %e,
                        "Device group insert failed"
                    );
                    let message = e.to_string();
                    for &i in &indexes {
                        outcomes[i] = Some(Err(SinkError::Unwritable(message.clone())));
                    }
                }
            }
        }

        outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| Err(SinkError::Unwritable("record not attempted".to_string()))))
            .collect()
    }
}

/// Indexes of `records` grouped by device id, each group in input order
pub fn group_by_device(records: &[TelemetryRecord]) -> BTreeMap<i64, Vec<usize>> {
    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, record) in records.iter().enumerate() {
        groups.entry(record.device_id).or_default().push(i);
    }
    groups
}
