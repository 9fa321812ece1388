use anyhow::Result;
use student_progress_core::{
    Answer, AnswerRepository, Fetched, Grade, GradeRepository, NaturalKey, Progress,
    ProgressDraft, ProgressRepository, ProgressStatus, RolloutStage, Submission,
    SubmissionDraft, SubmissionRepository,
};

/// Aggregate repository that reads from the authoritative representation and mirrors
/// every write into the other one, as selected by the rollout stage.
///
/// Primary failures propagate to the caller. Mirror failures are logged and swallowed;
/// the next migration pass repairs the gap.
#[derive(Debug, Clone)]
pub struct DualWriteRepository<L, R> {
    stage: RolloutStage,
    legacy: L,
    relational: R,
}

impl<L, R> DualWriteRepository<L, R> {
    #[must_use]
    pub fn for_stage(stage: RolloutStage, legacy: L, relational: R) -> Self {
        Self { stage, legacy, relational }
    }

    #[must_use]
    pub fn stage(&self) -> RolloutStage {
        self.stage
    }

    #[must_use]
    pub fn legacy(&self) -> &L {
        &self.legacy
    }

    #[must_use]
    pub fn relational(&self) -> &R {
        &self.relational
    }

    fn sides<'a, T: ?Sized>(&self, legacy: &'a T, relational: &'a T) -> (&'a T, Option<&'a T>) {
        match self.stage {
            RolloutStage::LegacyOnly => (legacy, None),
            RolloutStage::DualWriteReadLegacy => (legacy, Some(relational)),
            RolloutStage::DualWriteReadRelational => (relational, Some(legacy)),
        }
    }

    fn mirror_failed(&self, operation: &str, key: NaturalKey, err: &anyhow::Error) {
        tracing::warn!(
            stage = self.stage.as_str(),
            operation,
            key = %key,
            error = %format!("{err:#}"),
            "mirror write failed"
        );
    }
}

impl<L, R> DualWriteRepository<L, R>
where
    L: SubmissionRepository + AnswerRepository + GradeRepository,
    R: SubmissionRepository + AnswerRepository + GradeRepository,
{
    fn submission_sides(
        &self,
    ) -> (&dyn SubmissionRepository, Option<&dyn SubmissionRepository>) {
        let legacy: &dyn SubmissionRepository = &self.legacy;
        let relational: &dyn SubmissionRepository = &self.relational;
        self.sides(legacy, relational)
    }

    fn answer_sides(&self) -> (&dyn AnswerRepository, Option<&dyn AnswerRepository>) {
        let legacy: &dyn AnswerRepository = &self.legacy;
        let relational: &dyn AnswerRepository = &self.relational;
        self.sides(legacy, relational)
    }

    fn grade_sides(&self) -> (&dyn GradeRepository, Option<&dyn GradeRepository>) {
        let legacy: &dyn GradeRepository = &self.legacy;
        let relational: &dyn GradeRepository = &self.relational;
        self.sides(legacy, relational)
    }

    /// The mirror's copy of `submission`, created lazily when the mirror lacks it.
    fn mirror_submission(&self, submission: &Submission) -> Option<Result<Submission>> {
        let (_, mirror) = self.submission_sides();
        mirror.map(|mirror| {
            mirror.get_or_create_submission(&submission.to_draft()).map(Fetched::into_inner)
        })
    }

    fn existing_mirror_submission(&self, key: NaturalKey) -> Option<Result<Option<Submission>>> {
        let (_, mirror) = self.submission_sides();
        mirror.map(|mirror| mirror.get_submission(key))
    }
}

fn progress_sides<'a, S, L, R>(
    repo: &'a DualWriteRepository<L, R>,
) -> (&'a dyn ProgressRepository<S>, Option<&'a dyn ProgressRepository<S>>)
where
    S: ProgressStatus,
    L: ProgressRepository<S>,
    R: ProgressRepository<S>,
{
    let legacy: &dyn ProgressRepository<S> = &repo.legacy;
    let relational: &dyn ProgressRepository<S> = &repo.relational;
    repo.sides(legacy, relational)
}

impl<S, L, R> ProgressRepository<S> for DualWriteRepository<L, R>
where
    S: ProgressStatus,
    L: ProgressRepository<S>,
    R: ProgressRepository<S>,
{
    fn create(&self, draft: &ProgressDraft<S>) -> Result<Progress<S>> {
        let (primary, mirror) = progress_sides(self);
        let progress = primary.create(draft)?;
        if let Some(mirror) = mirror {
            if let Err(err) = mirror.get_or_create(&progress.to_draft()) {
                self.mirror_failed("create", draft.key, &err);
            }
        }
        Ok(progress)
    }

    fn get(&self, key: NaturalKey) -> Result<Option<Progress<S>>> {
        let (primary, _) = progress_sides(self);
        primary.get(key)
    }

    fn get_or_create(&self, draft: &ProgressDraft<S>) -> Result<Fetched<Progress<S>>> {
        let (primary, mirror) = progress_sides(self);
        let fetched = primary.get_or_create(draft)?;
        if let Some(mirror) = mirror {
            if let Err(err) = mirror.get_or_create(&fetched.get().to_draft()) {
                self.mirror_failed("get_or_create", draft.key, &err);
            }
        }
        Ok(fetched)
    }

    fn save(&self, progress: &Progress<S>) -> Result<()> {
        let (primary, mirror) = progress_sides(self);
        primary.save(progress)?;
        if let Some(mirror) = mirror {
            let mirrored = mirror.get_or_create(&progress.to_draft()).and_then(|fetched| {
                match fetched {
                    Fetched::Created(_) => Ok(()),
                    Fetched::Existing(mut copy) => {
                        copy.apply_state(progress);
                        mirror.save(&copy)
                    }
                }
            });
            if let Err(err) = mirrored {
                self.mirror_failed("save", progress.key(), &err);
            }
        }
        Ok(())
    }
}

impl<L, R> SubmissionRepository for DualWriteRepository<L, R>
where
    L: SubmissionRepository + AnswerRepository + GradeRepository,
    R: SubmissionRepository + AnswerRepository + GradeRepository,
{
    fn create_submission(&self, draft: &SubmissionDraft) -> Result<Submission> {
        let (primary, mirror) = self.submission_sides();
        let submission = primary.create_submission(draft)?;
        if let Some(mirror) = mirror {
            if let Err(err) = mirror.get_or_create_submission(&submission.to_draft()) {
                self.mirror_failed("create_submission", draft.key, &err);
            }
        }
        Ok(submission)
    }

    fn get_submission(&self, key: NaturalKey) -> Result<Option<Submission>> {
        let (primary, _) = self.submission_sides();
        primary.get_submission(key)
    }

    fn get_or_create_submission(&self, draft: &SubmissionDraft) -> Result<Fetched<Submission>> {
        let (primary, _) = self.submission_sides();
        let fetched = primary.get_or_create_submission(draft)?;
        if let Some(Err(err)) = self.mirror_submission(fetched.get()) {
            self.mirror_failed("get_or_create_submission", draft.key, &err);
        }
        Ok(fetched)
    }

    fn get_question_ids(&self, submission_id: i64) -> Result<Vec<i64>> {
        let (primary, _) = self.submission_sides();
        primary.get_question_ids(submission_id)
    }

    fn save_submission(&self, submission: &Submission) -> Result<()> {
        let (primary, mirror) = self.submission_sides();
        primary.save_submission(submission)?;
        if let Some(mirror) = mirror {
            let mirrored = mirror.get_or_create_submission(&submission.to_draft()).and_then(
                |fetched| match fetched {
                    Fetched::Created(_) => Ok(()),
                    Fetched::Existing(mut copy) => {
                        copy.final_grade = submission.final_grade;
                        copy.created_at = submission.created_at;
                        copy.updated_at = submission.updated_at;
                        mirror.save_submission(&copy)
                    }
                },
            );
            if let Err(err) = mirrored {
                self.mirror_failed("save_submission", submission.key(), &err);
            }
        }
        Ok(())
    }

    fn delete_submission(&self, submission: &Submission) -> Result<()> {
        let (primary, mirror) = self.submission_sides();
        primary.delete_submission(submission)?;
        if let Some(mirror) = mirror {
            let mirrored = mirror.get_submission(submission.key()).and_then(|copy| match copy {
                Some(copy) => mirror.delete_submission(&copy),
                None => Ok(()),
            });
            if let Err(err) = mirrored {
                self.mirror_failed("delete_submission", submission.key(), &err);
            }
        }
        Ok(())
    }
}

impl<L, R> AnswerRepository for DualWriteRepository<L, R>
where
    L: SubmissionRepository + AnswerRepository + GradeRepository,
    R: SubmissionRepository + AnswerRepository + GradeRepository,
{
    fn create_answer(
        &self,
        submission: &Submission,
        question_id: i64,
        value: &str,
    ) -> Result<Answer> {
        let (primary, mirror) = self.answer_sides();
        let answer = primary.create_answer(submission, question_id, value)?;
        if let (Some(mirror), Some(copy)) = (mirror, self.mirror_submission(submission)) {
            let mirrored = copy.and_then(|copy| mirror.create_answer(&copy, question_id, value));
            if let Err(err) = mirrored {
                self.mirror_failed("create_answer", submission.key(), &err);
            }
        }
        Ok(answer)
    }

    fn get_answers(&self, submission_id: i64) -> Result<Vec<Answer>> {
        let (primary, _) = self.answer_sides();
        primary.get_answers(submission_id)
    }

    fn delete_answers(&self, submission: &Submission) -> Result<()> {
        let (primary, mirror) = self.answer_sides();
        primary.delete_answers(submission)?;
        if let (Some(mirror), Some(copy)) =
            (mirror, self.existing_mirror_submission(submission.key()))
        {
            let mirrored = copy.and_then(|copy| match copy {
                Some(copy) => mirror.delete_answers(&copy),
                None => Ok(()),
            });
            if let Err(err) = mirrored {
                self.mirror_failed("delete_answers", submission.key(), &err);
            }
        }
        Ok(())
    }
}

impl<L, R> GradeRepository for DualWriteRepository<L, R>
where
    L: SubmissionRepository + AnswerRepository + GradeRepository,
    R: SubmissionRepository + AnswerRepository + GradeRepository,
{
    fn create_grade(
        &self,
        submission: &Submission,
        question_id: i64,
        points: i64,
        feedback: Option<&str>,
    ) -> Result<Grade> {
        let (primary, mirror) = self.grade_sides();
        let grade = primary.create_grade(submission, question_id, points, feedback)?;
        if let (Some(mirror), Some(copy)) = (mirror, self.mirror_submission(submission)) {
            let mirrored = copy
                .and_then(|copy| mirror.create_grade(&copy, question_id, points, feedback));
            if let Err(err) = mirrored {
                self.mirror_failed("create_grade", submission.key(), &err);
            }
        }
        Ok(grade)
    }

    fn get_grades(&self, submission_id: i64) -> Result<Vec<Grade>> {
        let (primary, _) = self.grade_sides();
        primary.get_grades(submission_id)
    }

    fn delete_grades(&self, submission: &Submission) -> Result<()> {
        let (primary, mirror) = self.grade_sides();
        primary.delete_grades(submission)?;
        if let (Some(mirror), Some(copy)) =
            (mirror, self.existing_mirror_submission(submission.key()))
        {
            let mirrored = copy.and_then(|copy| match copy {
                Some(copy) => mirror.delete_grades(&copy),
                None => Ok(()),
            });
            if let Err(err) = mirrored {
                self.mirror_failed("delete_grades", submission.key(), &err);
            }
        }
        Ok(())
    }
}
