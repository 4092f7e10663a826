//! Fixed replies for every path that cannot produce a real answer.

use std::fmt;

use crate::admission::RejectReason;
use crate::upstream::FailureKind;

/// Why a reply is a canned fallback instead of an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// Admission rejected the request.
    Busy(RejectReason),
    /// The upstream call failed after retries.
    Upstream(FailureKind),
    /// No upstream credentials are configured.
    Offline,
    /// The conversation has no user prompt.
    Empty,
    /// The request body exceeded the size limit and was not read.
    Oversize,
    /// The pipeline panicked.
    Internal,
}

impl FallbackReason {
    /// Stable tag reported in reply metadata.
    pub fn tag(self) -> &'static str {
        match self {
            FallbackReason::Busy(RejectReason::GlobalSaturated) => "busy_global_saturated",
            FallbackReason::Busy(RejectReason::Cooldown) => "busy_cooldown",
            FallbackReason::Busy(RejectReason::CallerSaturated) => "busy_caller_saturated",
            FallbackReason::Upstream(kind) => kind.as_str(),
            FallbackReason::Offline => "offline",
            FallbackReason::Empty => "empty",
            FallbackReason::Oversize => "oversize",
            FallbackReason::Internal => "internal",
        }
    }

    /// User-facing message.
    pub fn message(self) -> &'static str {
        match self {
            FallbackReason::Busy(RejectReason::Cooldown) => {
                "Bạn gửi hơi nhanh một chút, vui lòng đợi giây lát rồi hỏi lại nhé."
            }
            FallbackReason::Busy(_) => {
                "Trợ lý đang bận trả lời nhiều du khách, bạn vui lòng thử lại sau ít phút nhé."
            }
            FallbackReason::Upstream(FailureKind::QuotaOrOverload) => {
                "Hệ thống trả lời tự động đang quá tải, bạn vui lòng thử lại sau nhé."
            }
            FallbackReason::Upstream(FailureKind::NetworkOrTimeout) => {
                "Kết nối tới trợ lý đang chậm, bạn vui lòng thử lại sau giây lát."
            }
            FallbackReason::Upstream(FailureKind::ServiceUnavailable) => {
                "Dịch vụ trợ lý tạm thời gián đoạn, bạn vui lòng quay lại sau nhé."
            }
            FallbackReason::Upstream(FailureKind::Unknown) | FallbackReason::Internal => {
                "Xin lỗi, đã có lỗi xảy ra. Bạn vui lòng thử lại sau nhé."
            }
            FallbackReason::Offline => {
                "Trợ lý trực tuyến hiện chưa hoạt động. Bạn có thể xem thông tin điểm đến ngay trên trang nhé."
            }
            FallbackReason::Empty => {
                "Bạn muốn hỏi gì về chuyến đi? Hãy nhập câu hỏi để mình hỗ trợ nhé."
            }
            FallbackReason::Oversize => {
                "Tin nhắn quá dài, bạn vui lòng rút gọn câu hỏi rồi gửi lại nhé."
            }
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
