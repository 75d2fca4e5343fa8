//! Gradeflow Core Library
//!
//! Routes rubric criteria of a grading request to grading plugins and
//! reports one outcome per criterion.

pub mod bundler;
pub mod dispatcher;
pub mod domain;
pub mod emitter;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod plugins;
pub mod sandbox;
pub mod service;
pub mod telemetry;
pub mod transport;

pub use domain::{
    Criterion, CriterionFailed, CriterionGraded, CriterionOutcome, CriterionScore, FeedbackItem,
    GradeflowError, GradingRequest, Level, Result, ScoreBreakdown, ServiceEvent, SubmissionGraded,
    ValidationError,
};

pub use bundler::blob::{FileStore, FileStoreError, HttpBlobStore};
pub use bundler::{
    BundleError, BundleFailure, BundleInput, BundleReport, Bundler, BundlerConfig, FileBundle,
    PACK_FAILED_MESSAGE,
};

pub use dispatcher::{partition, Dispatcher, Partition, PluginGroup};
pub use emitter::{submission_graded, ResultEmitter};
pub use service::{decode_request, GradingService, ServiceSettings};

pub use plugins::ai::{AiGrader, GradingModel, HttpGradingModel};
pub use plugins::remote::{ActionCaller, HttpActionCaller, RemotePlugin};
pub use plugins::test_runner::TestRunnerPlugin;
pub use plugins::{
    categories, Plugin, PluginCategory, PluginError, PluginInfo, PluginKind, PluginRegistry,
};

pub use sandbox::{
    Callback, CallbackDisposition, CallbackKind, ExecutionControls, GoJudgeClient, OutputComparison,
    SandboxClient, SandboxError, SandboxMachine, SandboxSettings, SandboxStep, StartAttempt,
    UnknownCallbackPolicy,
};

pub use transport::amqp::AmqpTransport;
pub use transport::service_bus::ServiceBusTransport;
pub use transport::{
    EventTransport, HandlerError, MessageHandler, RetryPolicy, TransportError, CONNECT_TIMEOUT,
};
