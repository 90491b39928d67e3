//! This module provides the sinks usage reports are delivered to.
//!
//! Reports go either to a Kafka topic, through the rdkafka
//! ThreadedProducer, or to the process log. Client code can plug in
//! its own sink by implementing `Producer`, which also simplifies
//! unit tests.

use rdkafka::config::ClientConfig as RdKafkaConfig;
use rdkafka::producer::{BaseRecord, ThreadedProducer};
use rdkafka::producer::{DeliveryResult, ProducerContext};
use rdkafka::{ClientContext, Message};
#[cfg(test)]
use std::cell::RefCell;
use std::collections::HashMap;
#[cfg(test)]
use std::rc::Rc;
use std::str::from_utf8;
use thiserror::Error;
use tracing::{event, Level};

/// librdkafka settings of the report collector connection, kept as
/// plain strings so callers never see rdkafka types.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    settings: HashMap<String, String>,
}

impl KafkaConfig {
    /// Connection to `bootstrap_servers`. Entries of `override_params`
    /// win over the defaults, including the broker list.
    pub fn new_producer_config(
        bootstrap_servers: &str,
        override_params: Option<HashMap<String, String>>,
    ) -> Self {
        let mut settings = HashMap::from([(
            "bootstrap.servers".to_string(),
            bootstrap_servers.to_string(),
        )]);
        settings.extend(override_params.unwrap_or_default());
        KafkaConfig { settings }
    }
}

impl From<KafkaConfig> for RdKafkaConfig {
    fn from(config: KafkaConfig) -> Self {
        let mut client_config = RdKafkaConfig::new();
        for (name, value) in &config.settings {
            client_config.set(name, value);
        }
        client_config
    }
}

/// Logs the outcome of each usage report handed to librdkafka.
struct ReportDeliveryContext;

impl ClientContext for ReportDeliveryContext {}

impl ProducerContext for ReportDeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult, _delivery_opaque: Self::DeliveryOpaque) {
        match result {
            Ok(message) => event!(
                Level::DEBUG,
                "Usage report delivered to {}.",
                message.topic()
            ),
            Err((kafka_err, _)) => {
                event!(Level::ERROR, "Usage report was not delivered: {}", kafka_err)
            }
        }
    }
}

/// Report delivery errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The sink refused a usage report.
    #[error("failed to send usage report")]
    SendFailed(#[source] rdkafka::error::KafkaError),

    /// librdkafka rejected the collector settings.
    #[error("cannot create usage report producer: invalid kafka config")]
    InvalidConfig(#[source] rdkafka::error::KafkaError),
}

/// Destination of usage reports.
///
/// `payload` is one serialized JSON report message, carrying the
/// (object, caller) key, the cached names and the counters of a single
/// usage record. Messages carry no key or headers.
pub trait Producer {
    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError>;
}

/// Ships reports to a Kafka topic. Delivery is asynchronous; failures
/// after the message was queued only show up in the log.
pub struct KafkaProducer {
    producer: ThreadedProducer<ReportDeliveryContext>,
}

impl KafkaProducer {
    pub fn new(config: KafkaConfig) -> Result<KafkaProducer, ClientError> {
        let producer_config: RdKafkaConfig = config.into();
        let producer = producer_config
            .create_with_context(ReportDeliveryContext)
            .map_err(ClientError::InvalidConfig)?;
        Ok(KafkaProducer { producer })
    }
}

impl Producer for KafkaProducer {
    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError> {
        let record: BaseRecord<'_, [u8], [u8]> = BaseRecord::to(topic_name).payload(payload);
        self.producer
            .send(record)
            .map_err(|(error, _message)| ClientError::SendFailed(error))
    }
}

/// Writes every report to the log at INFO level. Used when there is no
/// collector to ship reports to.
#[derive(Debug, Default)]
pub struct LogProducer;

impl Producer for LogProducer {
    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError> {
        match from_utf8(payload) {
            Ok(text) => event!(Level::INFO, topic = topic_name, "{}", text),
            Err(_) => event!(
                Level::INFO,
                topic = topic_name,
                "binary report of {} bytes",
                payload.len()
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) struct DummyProducer {
    pub messages: Rc<RefCell<Vec<(String, Vec<u8>)>>>,
}

#[cfg(test)]
impl Producer for DummyProducer {
    fn send(&mut self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError> {
        self.messages
            .borrow_mut()
            .push((topic_name.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DummyProducer;
    use super::KafkaConfig;
    use super::LogProducer;
    use super::Producer;
    use rdkafka::config::ClientConfig as RdKafkaConfig;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[test]
    fn test_overrides_win() {
        let config = KafkaConfig::new_producer_config(
            "localhost:9092",
            Some(HashMap::from([(
                "bootstrap.servers".to_string(),
                "collector:9092".to_string(),
            )])),
        );
        let rdkafka_config: RdKafkaConfig = config.into();
        assert_eq!(rdkafka_config.get("bootstrap.servers"), Some("collector:9092"));
    }

    #[test]
    fn test_build_producer_configuration() {
        let config = KafkaConfig::new_producer_config(
            "localhost:9092",
            Some(HashMap::from([(
                "queued.max.messages.kbytes".to_string(),
                "1000000".to_string(),
            )])),
        );

        let rdkafka_config: RdKafkaConfig = config.into();
        assert_eq!(
            rdkafka_config.get("queued.max.messages.kbytes"),
            Some("1000000")
        );
        assert_eq!(rdkafka_config.get("bootstrap.servers"), Some("localhost:9092"));
    }

    #[test]
    fn test_dummy_producer() {
        let messages = Rc::new(RefCell::new(Vec::new()));
        let mut producer = DummyProducer {
            messages: Rc::clone(&messages),
        };
        let res = producer.send("topic", "message".as_bytes());
        assert!(res.is_ok());

        assert_eq!(messages.borrow().len(), 1);
        assert_eq!(messages.borrow()[0].0, "topic");
    }

    #[test]
    fn test_log_producer_never_fails() {
        let mut producer = LogProducer;
        assert!(producer.send("topic", br#"{"a":1}"#).is_ok());
        assert!(producer.send("topic", &[0xff, 0xfe]).is_ok());
    }
}
