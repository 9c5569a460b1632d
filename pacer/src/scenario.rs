use typed_builder::TypedBuilder;

use crate::{
    aggregate::WorkloadResultsSnapshot, db::Db, error::RunnerError, executor::Executor,
    operation::Operation,
};

/// A named workload: the adapter under test, the operations to replay and the
/// executor that replays them.
#[derive(TypedBuilder)]
pub struct Scenario<D, I, E>
where
    D: Db,
    I: IntoIterator<Item = Operation> + Send,
    I::IntoIter: Send + 'static,
    E: Executor<D, I>,
{
    #[builder(setter(into))]
    pub name: String,
    pub db: D,
    pub operations: I,
    pub executor: E,
}

impl<D, I, E> Scenario<D, I, E>
where
    D: Db,
    I: IntoIterator<Item = Operation> + Send,
    I::IntoIter: Send + 'static,
    E: Executor<D, I>,
{
    /// Consumes the scenario, the stream cannot be replayed twice.
    pub async fn run(self) -> Result<WorkloadResultsSnapshot, RunnerError> {
        let Self {
            name,
            db,
            operations,
            executor,
        } = self;
        executor.exec(&name, db, operations).await
    }
}
