use crate::{
    entities::enrollment,
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::EnrollmentRepository,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct EnrollmentService {
    enrollments: Arc<dyn EnrollmentRepository>,
    event_sender: Arc<EventSender>,
}

impl EnrollmentService {
    pub fn new(enrollments: Arc<dyn EnrollmentRepository>, event_sender: Arc<EventSender>) -> Self {
        Self {
            enrollments,
            event_sender,
        }
    }

    /// Enrolls `user_id` in `course_id`. An existing enrollment is returned
    /// unchanged.
    #[instrument(skip(self))]
    pub async fn enroll(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        payment_id: Option<Uuid>,
    ) -> Result<enrollment::Model, ServiceError> {
        if let Some(existing) = self.enrollments.find(user_id, course_id).await? {
            return Ok(existing);
        }

        let model = enrollment::Model {
            id: Uuid::new_v4(),
            user_id,
            course_id,
            payment_id,
            enrolled_at: Utc::now(),
        };

        match self.enrollments.insert(model).await {
            Ok(created) => {
                info!(%user_id, %course_id, enrollment_id = %created.id, "Enrolled user");
                self.event_sender
                    .send_or_log(Event::EnrollmentCreated {
                        user_id,
                        course_id,
                        enrollment_id: created.id,
                    })
                    .await;
                Ok(created)
            }
            // lost a race with a concurrent enroll
            Err(ServiceError::Conflict(_)) => self
                .enrollments
                .find(user_id, course_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::InternalError("Enrollment vanished after conflict".to_string())
                }),
            Err(e) => Err(e),
        }
    }

    pub async fn is_enrolled(&self, user_id: Uuid, course_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.enrollments.find(user_id, course_id).await?.is_some())
    }
}
