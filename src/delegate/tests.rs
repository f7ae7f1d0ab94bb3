//! Delegate Module Tests
//!
//! ## Test Scopes
//! - **Splits**: tiling, the per-split cap and key layout.
//! - **Schedules and handlers**: learning-rate schedules, SGD with aggregation, momentum
//!   and weight decay, AdaGrad, the version gate and checkpoint cadence.
//! - **TableDelegate**: the in-process path, a full round trip through table servers and
//!   two synchronous worker groups training together.

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::context::ProcessContext;
    use crate::delegate::param::{Param, ParamValue};
    use crate::delegate::sgd::{AdaGradHandler, LrSchedule, SgdConfig, SgdHandler};
    use crate::delegate::split::{SPLIT_KEY_MULTIPLIER, SplitPolicy};
    use crate::delegate::table_delegate::TableDelegate;
    use crate::error::{Error, Result};
    use crate::server::coordinator::Coordinator;
    use crate::server::table_server::TableServer;
    use crate::table::handler::MergeHandler;
    use crate::table::partition::LocalPartition;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    fn assert_all_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!(close(*a, *e), "expected {:?}, got {:?}", expected, actual);
        }
    }

    fn stored(data: Vec<f32>, threshold: u32) -> ParamValue {
        ParamValue {
            data,
            threshold,
            lr_mult: 1.0,
            wd_mult: 1.0,
            ..ParamValue::default()
        }
    }

    fn gradient(grad: Vec<f32>, version: u64) -> ParamValue {
        ParamValue {
            grad,
            version,
            ..ParamValue::default()
        }
    }

    fn sgd(lr: f32) -> SgdConfig {
        SgdConfig {
            learning_rate: LrSchedule::Fixed { base: lr },
            ..SgdConfig::default()
        }
    }

    // ============================================================
    // SPLIT TESTS
    // ============================================================

    #[test]
    fn test_split_lengths() {
        let even = SplitPolicy::new(2, 1, 1 << 20).split(1, 10).unwrap();
        let uneven = SplitPolicy::new(3, 1, 1 << 20).split(1, 7).unwrap();

        assert_eq!(even.iter().map(|s| s.len).collect::<Vec<_>>(), vec![5, 5]);
        assert_eq!(uneven.iter().map(|s| s.len).collect::<Vec<_>>(), vec![3, 3, 1]);
    }

    #[test]
    fn test_split_cap_adds_splits() {
        let policy = SplitPolicy::new(2, 1, 4);

        let splits = policy.split(1, 20).unwrap();

        assert_eq!(splits.len(), 5, "Two splits of 10 would exceed the cap of 4");
        assert!(splits.iter().all(|s| s.len <= 4));
    }

    #[test]
    fn test_splits_tile_the_parameter() {
        for (servers, per_server, cap) in [(1, 1, 1 << 20), (2, 3, 7), (5, 2, 100), (4, 1, 1)] {
            let policy = SplitPolicy::new(servers, per_server, cap);
            for len in [1usize, 2, 9, 64, 999] {
                let splits = policy.split(3, len).unwrap();

                let mut next = 0;
                for (index, split) in splits.iter().enumerate() {
                    assert_eq!(split.offset, next, "Splits must be contiguous");
                    assert_eq!(split.index, index);
                    assert!(split.len >= 1 && split.len <= cap);
                    next += split.len;
                }
                assert_eq!(next, len, "Splits must cover every value exactly once");
            }
        }
    }

    #[test]
    fn test_split_keys_are_unique_per_param() {
        let policy = SplitPolicy::new(3, 2, 5);
        let mut keys = HashSet::new();

        for param_id in 0..4u32 {
            for split in policy.split(param_id, 40).unwrap() {
                assert_eq!(split.key / SPLIT_KEY_MULTIPLIER, param_id as u64);
                assert_eq!(split.key % SPLIT_KEY_MULTIPLIER, split.index as u64);
                assert!(keys.insert(split.key), "Split key {} reused", split.key);
            }
        }
    }

    #[test]
    fn test_local_policy_keeps_param_whole() {
        let policy = SplitPolicy::new(0, 4, 2);

        let splits = policy.split(2, 100).unwrap();

        assert!(policy.is_local());
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].len, 100);
    }

    #[test]
    fn test_too_many_splits_rejected() {
        let policy = SplitPolicy::new(1, 1, 1);

        let result = policy.split(0, SPLIT_KEY_MULTIPLIER as usize);

        assert!(matches!(result, Err(Error::Config(_))));
    }

    // ============================================================
    // SCHEDULE TESTS
    // ============================================================

    #[test]
    fn test_learning_rate_schedules() {
        let cases = [
            (LrSchedule::Fixed { base: 0.1 }, 100, 0.1),
            (
                LrSchedule::Linear {
                    base: 1.0,
                    final_value: 0.0,
                    change_steps: 10,
                },
                5,
                0.5,
            ),
            (
                LrSchedule::Exponential {
                    base: 1.0,
                    change_steps: 2,
                },
                4,
                0.25,
            ),
            (
                LrSchedule::InverseT {
                    base: 1.0,
                    final_value: 10.0,
                },
                10,
                0.5,
            ),
            (
                LrSchedule::Inverse {
                    base: 1.0,
                    gamma: 1.0,
                    power: 1.0,
                },
                1,
                0.5,
            ),
            (
                LrSchedule::Step {
                    base: 1.0,
                    gamma: 0.1,
                    change_steps: 10,
                },
                25,
                0.01,
            ),
        ];

        for (schedule, step, expected) in cases {
            let got = schedule.at(step);
            assert!(close(got, expected), "{:?} at {} gave {}", schedule, step, got);
        }
    }

    #[test]
    fn test_schedule_parses_from_json() {
        let schedule: LrSchedule =
            serde_json::from_str(r#"{"step": {"base": 0.5, "gamma": 0.5, "change_steps": 1}}"#).unwrap();

        assert!(close(schedule.at(2), 0.125));
    }

    // ============================================================
    // HANDLER TESTS
    // ============================================================

    #[test]
    fn test_sgd_applies_mean_after_threshold() {
        let handler = SgdHandler::new(sgd(0.1));
        let mut value = stored(vec![1.0, 1.0], 2);

        // ACT: first of two gradients
        assert!(handler.update(&mut value, gradient(vec![1.0, 1.0], 0)));

        assert_eq!(value.num_aggregate, 1);
        assert_all_close(&value.data, &[1.0, 1.0]);
        assert!(handler.get(&0, 0, &value).is_none(), "Partial aggregation hides the value");

        // ACT: second gradient completes the round
        assert!(handler.update(&mut value, gradient(vec![3.0, 3.0], 0)));

        // ASSERT: 1 - mean(0.1 * 1, 0.1 * 3)
        assert_eq!(value.num_aggregate, 0);
        assert_eq!(value.version, 1);
        let published = handler.get(&0, 1, &value).unwrap();
        assert_all_close(&published.data, &[0.8, 0.8]);
        assert!(published.history.is_empty(), "Optimiser state stays on the server");
        assert!(handler.get(&0, 2, &value).is_none(), "Step 2 is not there yet");
    }

    #[test]
    fn test_sgd_momentum_carries_history() {
        let handler = SgdHandler::new(SgdConfig {
            momentum: 0.5,
            ..sgd(0.1)
        });
        let mut value = stored(vec![1.0], 1);

        handler.update(&mut value, gradient(vec![1.0], 0));
        assert_all_close(&value.data, &[0.9]);
        assert_all_close(&value.history, &[0.05]);

        handler.update(&mut value, gradient(vec![1.0], 1));
        assert_all_close(&value.data, &[0.75]);
        assert_eq!(value.version, 2);
    }

    #[test]
    fn test_sgd_weight_decay_pulls_towards_zero() {
        let handler = SgdHandler::new(SgdConfig {
            weight_decay: 0.5,
            ..sgd(0.1)
        });
        let mut value = stored(vec![2.0], 1);

        handler.update(&mut value, gradient(vec![0.0], 0));

        assert_all_close(&value.data, &[1.9]);
    }

    #[test]
    fn test_gradient_length_mismatch_is_refused() {
        let handler = SgdHandler::new(sgd(0.1));
        let mut value = stored(vec![1.0, 2.0], 1);

        assert!(!handler.update(&mut value, gradient(vec![1.0], 0)));
        assert_eq!(value.version, 0);
        assert_all_close(&value.data, &[1.0, 2.0]);
    }

    #[test]
    fn test_malformed_gradient_is_an_error() {
        let handler = SgdHandler::new(sgd(0.1));
        let value = stored(vec![1.0, 2.0], 1);
        assert!(matches!(
            handler.check(&7, &value, &gradient(vec![1.0], 0)),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(handler.check(&7, &value, &gradient(vec![1.0, 1.0], 0)).is_ok());

        let mut partition: LocalPartition<u64, ParamValue> = LocalPartition::new(
            0,
            8,
            Arc::new(AdaGradHandler::new(0.1, SgdConfig::default())),
        );
        partition.put(7, stored(vec![1.0, 2.0], 1));

        let result = partition.update(7, gradient(vec![1.0], 0));

        assert!(
            matches!(result, Err(Error::ProtocolViolation(_))),
            "A malformed gradient must fail, not wait for a retry"
        );
        assert_all_close(&partition.get(&7).unwrap().data, &[1.0, 2.0]);
    }

    #[test]
    fn test_adagrad_scales_by_history() {
        let handler = AdaGradHandler::new(0.1, SgdConfig::default());
        let mut value = stored(vec![1.0], 1);

        handler.update(&mut value, gradient(vec![2.0], 0));

        assert_all_close(&value.data, &[0.9]);
        assert_all_close(&value.history, &[4.0]);
        assert_eq!(value.version, 1);
    }

    #[test]
    fn test_adagrad_sums_until_threshold() {
        let handler = AdaGradHandler::new(0.1, SgdConfig::default());
        let mut value = stored(vec![1.0], 2);

        assert!(handler.update(&mut value, gradient(vec![1.0], 0)));
        assert_eq!(value.version, 0);
        assert!(handler.get(&0, 0, &value).is_none());

        assert!(handler.update(&mut value, gradient(vec![1.0], 0)));

        // Summed gradient 2: 1 - 0.1 * 2 / sqrt(4)
        assert_all_close(&value.data, &[0.9]);
        assert_eq!(value.version, 1);
        assert_eq!(value.num_aggregate, 0);
        assert!(handler.get(&0, 1, &value).is_some());
    }

    #[test]
    fn test_checkpoint_cadence() {
        let handler = SgdHandler::new(SgdConfig {
            checkpoint_after: 2,
            checkpoint_every: 3,
            ..SgdConfig::default()
        });
        let at = |version: u64| ParamValue {
            version,
            ..ParamValue::default()
        };

        let due: Vec<u64> = (0..12).filter(|&v| handler.is_checkpointable(&0, &at(v))).collect();

        assert_eq!(due, vec![5, 8, 11]);
        assert!(
            !SgdHandler::default().is_checkpointable(&0, &at(3)),
            "Checkpoints are off by default"
        );
    }

    // ============================================================
    // LOCAL DELEGATE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_local_delegate_round_trip() {
        let delegate = TableDelegate::local(Arc::new(SgdHandler::new(sgd(0.5))));
        let mut param = Param::new(1, vec![1.0, 2.0, 3.0]);

        delegate.put(&param, 0).unwrap();
        param.grad = vec![1.0, 1.0, 1.0];
        delegate.update(&param, 0).unwrap();
        param.data = vec![0.0; 3];
        delegate.get(&mut param, 1).await.unwrap();

        assert!(delegate.is_local());
        assert_all_close(&param.data, &[0.5, 1.5, 2.5]);
        assert!(
            delegate.get(&mut param, 2).await.is_err(),
            "No peer can ever publish step 2 in local mode"
        );
    }

    #[test]
    fn test_local_update_before_put_fails() {
        let delegate = TableDelegate::local(Arc::new(SgdHandler::new(sgd(0.1))));
        let param = Param::new(4, vec![1.0; 8]);

        assert!(matches!(delegate.update(&param, 0), Err(Error::MissingKey)));
    }

    #[test]
    fn test_update_checks_gradient_length() {
        let delegate = TableDelegate::local(Arc::new(SgdHandler::new(sgd(0.1))));
        let mut param = Param::new(4, vec![1.0; 8]);
        delegate.put(&param, 0).unwrap();
        param.grad.truncate(3);

        assert!(matches!(delegate.update(&param, 0), Err(Error::ProtocolViolation(_))));
    }

    // ============================================================
    // REMOTE DELEGATE TESTS
    // ============================================================

    async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(10), future)
            .await
            .expect("operation timed out")
    }

    /// Table servers 0 and 1 plus the coordinator, with parameter table 5 assigned.
    async fn boot_cluster(
        config: &Config,
        lr: f32,
    ) -> (Vec<TableDelegate>, Vec<Arc<TableServer>>, Coordinator) {
        let contexts = ProcessContext::local_cluster(config).await.unwrap();
        let delegates: Vec<TableDelegate> = contexts
            .iter()
            .map(|ctx| TableDelegate::for_context(ctx, 5, Arc::new(SgdHandler::new(sgd(lr)))).unwrap())
            .collect();

        let (coordinator_ctx, workers) = contexts.split_last().unwrap();
        let mut coordinator = Coordinator::new(coordinator_ctx.clone()).unwrap();
        let servers: Vec<_> = workers.iter().map(|ctx| TableServer::new(ctx.clone())).collect();
        for server in &servers {
            server.start().unwrap();
        }
        within(coordinator.init_table_servers()).await.unwrap();
        for server in &servers {
            within(server.wait_assigned()).await.unwrap();
        }
        (delegates, servers, coordinator)
    }

    async fn shut_down(servers: Vec<Arc<TableServer>>, coordinator: Coordinator) {
        let end = tokio::spawn(async move { coordinator.wait_for_job_end().await });
        let stops: Vec<_> = servers
            .iter()
            .map(|server| {
                let server = server.clone();
                tokio::spawn(async move { server.shutdown().await })
            })
            .collect();
        for stop in stops {
            within(stop).await.unwrap().unwrap();
        }
        within(end).await.unwrap().unwrap();
    }

    /// One worker group: read the step's parameter, send a constant gradient.
    async fn train(delegate: &TableDelegate, grad: f32, steps: u64) -> Result<Vec<f32>> {
        let mut param = Param::new(3, vec![0.0; 10]);
        for step in 0..steps {
            delegate.get(&mut param, step).await?;
            param.grad = vec![grad; param.len()];
            delegate.update(&param, step)?;
        }
        delegate.get(&mut param, steps).await?;
        Ok(param.data)
    }

    #[tokio::test]
    async fn test_remote_delegate_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            size: 3,
            num_table_servers: 2,
            splits_per_server: 2,
            max_split_len: 3,
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let (delegates, servers, coordinator) = boot_cluster(&config, 0.5).await;

        // ARRANGE: ten values become splits of 3, 3, 3, 1
        let values: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let mut writer = Param::new(2, values.clone());
        let mut reader = Param::new(2, vec![0.0; 10]);
        assert_eq!(delegates[0].register(&writer).unwrap(), 4);
        assert!(!delegates[0].is_local());

        // ACT: the writer reads back first, which orders its puts before rank 1's gets
        delegates[0].put(&writer, 0).unwrap();
        let mut echo = Param::new(2, vec![0.0; 10]);
        within(delegates[0].get(&mut echo, 0)).await.unwrap();
        within(delegates[1].get(&mut reader, 0)).await.unwrap();

        // ASSERT
        assert_eq!(echo.data, values);
        assert_eq!(reader.data, values, "Every split should land at its offset");

        writer.grad = vec![1.0; 10];
        delegates[0].update(&writer, 0).unwrap();
        within(delegates[1].get(&mut reader, 1)).await.unwrap();
        let expected: Vec<f32> = values.iter().map(|v| v - 0.5).collect();
        assert_all_close(&reader.data, &expected);

        shut_down(servers, coordinator).await;
    }

    #[tokio::test]
    async fn test_synchronous_groups_apply_mean_gradient() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            size: 3,
            num_table_servers: 2,
            num_groups: 2,
            synchronous: true,
            splits_per_server: 2,
            max_split_len: 3,
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let (delegates, servers, coordinator) = boot_cluster(&config, 0.1).await;

        // ARRANGE: rank 0 seeds the parameter, the barrier publishes it to both groups
        let initial: Vec<f32> = (0..10).map(|i| i as f32).collect();
        delegates[0].put(&Param::new(3, initial.clone()), 0).unwrap();
        let (first, second, released) = within(async {
            tokio::join!(servers[0].barrier(), servers[1].barrier(), coordinator.serve_barrier())
        })
        .await;
        first.unwrap();
        second.unwrap();
        released.unwrap();

        // ACT: group 0 sends gradient 1, group 1 gradient 3, for three steps
        let (group0, group1) = within(async {
            tokio::join!(train(&delegates[0], 1.0, 3), train(&delegates[1], 3.0, 3))
        })
        .await;

        // ASSERT: each step applies the mean gradient 2 at rate 0.1
        let expected: Vec<f32> = initial.iter().map(|v| v - 0.6).collect();
        assert_all_close(&group0.unwrap(), &expected);
        assert_all_close(&group1.unwrap(), &expected);

        shut_down(servers, coordinator).await;
    }
}
