use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{info, warn};

use crate::analyzer::ReportAnalyzer;
use crate::ebpf::{EbpfFileRequest, EbpfFileServer};
use crate::metrics;
use crate::model::{
    SampleMetric, Trace, GROUP_ONOFF_METRIC, GROUP_PROFILING_SIGNAL, GROUP_SPAN_TRACE,
};
use crate::profile::ProfileCenter;
use crate::sampler::MemorySampler;
use crate::storage::ColumnarWriter;
use crate::threshold::ThresholdCache;

pub mod pb {
    tonic::include_proto!("periscope.v1");
}

use pb::file_service_server::{FileService, FileServiceServer};
use pb::profile_service_server::{ProfileService, ProfileServiceServer};
use pb::sample_service_server::{SampleService, SampleServiceServer};
use pb::slow_threshold_service_server::{SlowThresholdService, SlowThresholdServiceServer};
use pb::trace_service_server::{TraceService, TraceServiceServer};

pub struct TraceGrpcService {
    analyzer: Arc<ReportAnalyzer>,
    writer: Arc<ColumnarWriter>,
}

#[tonic::async_trait]
impl TraceService for TraceGrpcService {
    async fn store_data_groups(
        &self,
        request: Request<pb::DataGroups>,
    ) -> Result<Response<pb::StoreReply>, Status> {
        let groups = request.into_inner();
        let count = groups.datas.len();
        match groups.name.as_str() {
            GROUP_ONOFF_METRIC => {
                for data in &groups.datas {
                    self.analyzer.cache_metric(data).await;
                }
                self.writer.batch_store(&groups.name, groups.datas);
            }
            GROUP_SPAN_TRACE => {
                for data in &groups.datas {
                    self.analyzer.cache_trace(data).await;
                }
            }
            GROUP_PROFILING_SIGNAL => {
                // Same shape as a span trace but without full labels; goes
                // straight to span storage for the profiling views.
                for data in &groups.datas {
                    match Trace::from_json(data) {
                        Ok(signal) => self.writer.store_trace_group(&signal),
                        Err(err) => warn!(%err, "skip malformed profiling signal"),
                    }
                }
            }
            _ => self.writer.batch_store(&groups.name, groups.datas),
        }
        if count > 0 {
            metrics::inc_received_message(&groups.name);
        }
        Ok(Response::new(pb::StoreReply {}))
    }
}

pub struct ProfileGrpcService {
    center: Arc<ProfileCenter>,
}

#[tonic::async_trait]
impl ProfileService for ProfileGrpcService {
    async fn query_profiles(
        &self,
        request: Request<pb::ProfileQuery>,
    ) -> Result<Response<pb::ProfileResult>, Status> {
        let query = request.into_inner();
        let answer = self
            .center
            .query_profiles(
                &query.node_ip,
                query.query_time,
                query.normal_trace_ids,
                query.slow_trace_ids,
                query.error_trace_ids,
            )
            .await;
        Ok(Response::new(pb::ProfileResult {
            query_time: answer.query_time,
            sample_count: answer.sample_count,
            normal_trace_ids: answer.normal_trace_ids,
            slow_trace_ids: answer.slow_trace_ids,
            error_trace_ids: answer.error_trace_ids,
            close_pid_urls: answer.close_pid_urls,
            recover_pid_urls: answer.recover_pid_urls,
            signals: answer
                .signals
                .into_iter()
                .map(|signal| pb::ProfileSignal {
                    pid: signal.pid,
                    tid: signal.tid,
                    start_time: signal.start_time,
                    end_time: signal.end_time,
                })
                .collect(),
        }))
    }
}

pub struct SampleGrpcService {
    enable: bool,
    sampler: Arc<MemorySampler>,
}

#[tonic::async_trait]
impl SampleService for SampleGrpcService {
    async fn get_sample_value(
        &self,
        request: Request<pb::SampleMetric>,
    ) -> Result<Response<pb::SampleResult>, Status> {
        if !self.enable {
            return Ok(Response::new(pb::SampleResult { value: 0 }));
        }
        let metric = request.into_inner();
        let value = self.sampler.record_metric(&SampleMetric {
            node_ip: metric.node_ip,
            query_time: metric.query_time,
            memory: metric.memory,
            memory_limit: metric.memory_limit,
            cache_second: metric.cache_second,
        });
        Ok(Response::new(pb::SampleResult { value }))
    }
}

pub struct ThresholdGrpcService {
    thresholds: Arc<ThresholdCache>,
}

#[tonic::async_trait]
impl SlowThresholdService for ThresholdGrpcService {
    async fn query_slow_threshold(
        &self,
        _request: Request<pb::SlowThresholdRequest>,
    ) -> Result<Response<pb::SlowThresholdResponse>, Status> {
        let datas = self
            .thresholds
            .all()
            .into_iter()
            .map(|threshold| pb::SlowThresholdData {
                url: threshold.url,
                value: threshold.value,
                threshold_type: threshold.threshold_type,
                range: threshold.range,
                multiple: threshold.multiple,
                service_name: threshold.service_name,
                container_id: threshold.container_id,
            })
            .collect();
        Ok(Response::new(pb::SlowThresholdResponse {
            datas,
            exceptions: Vec::new(),
        }))
    }
}

pub struct FileGrpcService {
    server: Arc<EbpfFileServer>,
}

#[tonic::async_trait]
impl FileService for FileGrpcService {
    async fn get_file(
        &self,
        request: Request<pb::FileRequest>,
    ) -> Result<Response<pb::FileResponse>, Status> {
        let req = request.into_inner();
        let (file_name, file_content) = self
            .server
            .get_file(&EbpfFileRequest {
                agent_version: req.agent_version,
                os_version: req.os_version,
                os_distribution: req.os_distribution,
                arch: req.arch,
                kernel_version: req.kernel_version,
            })
            .await
            .map_err(|err| Status::not_found(err.to_string()))?;
        Ok(Response::new(pb::FileResponse {
            file_name,
            file_content,
        }))
    }
}

/// Everything the gRPC surface needs from the wired service context.
pub struct GrpcServices {
    pub analyzer: Arc<ReportAnalyzer>,
    pub writer: Arc<ColumnarWriter>,
    pub profile: Arc<ProfileCenter>,
    pub sampler: Arc<MemorySampler>,
    pub sample_enable: bool,
    pub thresholds: Arc<ThresholdCache>,
    pub ebpf: Arc<EbpfFileServer>,
}

pub async fn serve_grpc(
    port: u16,
    services: GrpcServices,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let mut stop = shutdown.subscribe();
    info!(%addr, "start grpc server");
    Server::builder()
        .add_service(TraceServiceServer::new(TraceGrpcService {
            analyzer: services.analyzer,
            writer: services.writer,
        }))
        .add_service(ProfileServiceServer::new(ProfileGrpcService {
            center: services.profile,
        }))
        .add_service(SampleServiceServer::new(SampleGrpcService {
            enable: services.sample_enable,
            sampler: services.sampler,
        }))
        .add_service(SlowThresholdServiceServer::new(ThresholdGrpcService {
            thresholds: services.thresholds,
        }))
        .add_service(FileServiceServer::new(FileGrpcService {
            server: services.ebpf,
        }))
        .serve_with_shutdown(addr, async {
            let _ = stop.recv().await;
            info!("shutting down grpc server");
        })
        .await?;
    Ok(())
}
