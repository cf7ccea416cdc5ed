//! 包装器与中间件链的行为契约测试。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use testctx::{
    Context, ContextError, LogLevel, Middleware, RecordingLogger, RunFn, T, TestFn, TestMiddleware,
    host, middleware,
};

/// 跨线程共享的调用轨迹。
#[derive(Clone, Default)]
struct Trail(Arc<Mutex<Vec<String>>>);

impl Trail {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

fn root(unit: host::TestUnit) -> T {
    T::new(unit, &Context::background(), Vec::new())
}

fn around(label: &'static str, trail: &Trail) -> TestMiddleware {
    let trail = trail.clone();
    Middleware::new(move |next: TestFn| {
        let trail = trail.clone();
        RunFn::new(move |ctx, t| {
            trail.push(format!("before:{label}"));
            next.call(ctx, t);
            trail.push(format!("after:{label}"));
        })
    })
}

fn tag(label: &'static str, trail: &Trail) -> TestMiddleware {
    let trail = trail.clone();
    Middleware::new(move |next: TestFn| {
        let trail = trail.clone();
        RunFn::new(move |ctx, t| {
            trail.push(label);
            next.call(ctx, t);
        })
    })
}

fn counting(calls: &Arc<AtomicUsize>) -> TestMiddleware {
    let calls = Arc::clone(calls);
    Middleware::new(move |next: TestFn| {
        let calls = Arc::clone(&calls);
        RunFn::new(move |ctx, t| {
            calls.fetch_add(1, Ordering::SeqCst);
            next.call(ctx, t);
        })
    })
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Depth(usize);

#[derive(Clone, Copy, Debug, PartialEq)]
struct Marker;

fn counting_depth() -> TestMiddleware {
    Middleware::new(|next: TestFn| {
        RunFn::new(move |ctx: Context, t| {
            let depth = ctx.value::<Depth>().map_or(0, |d| d.0);
            next.call(ctx.with_value(Depth(depth + 1)), t);
        })
    })
}

fn marking() -> TestMiddleware {
    Middleware::new(|next: TestFn| RunFn::new(move |ctx: Context, t| next.call(ctx.with_value(Marker), t)))
}

/// 验证中间件按注册顺序由外向内包裹测试体。
///
/// # 教案式说明
/// - **测试目标（Why）**：先注册者位于外层，是全部组合语义的基础；
/// - **验收契约（What）**：轨迹严格为 `before:outer → before:inner → test → after:inner → after:outer`。
#[test]
fn middleware_runs_outer_to_inner() {
    let trail = Trail::default();
    let probe = trail.clone();
    host::test("TestMiddlewareInvocation", move |unit| {
        let t = root(unit);
        t.use_middleware([around("outer", &probe)]);
        t.use_middleware([around("inner", &probe)]);
        let body = probe.clone();
        t.run("subtest", move |_ctx, _t| body.push("test"));
    });

    assert_eq!(
        trail.snapshot(),
        vec!["before:outer", "before:inner", "test", "after:inner", "after:outer"]
    );
}

#[test]
fn middleware_factory_is_invoked_per_run() {
    let count = Arc::new(AtomicUsize::new(0));
    let factory_calls = Arc::clone(&count);
    host::test("TestMiddlewareReuse", move |unit| {
        let t = root(unit);
        t.use_middleware([Middleware::new(move |next: TestFn| {
            factory_calls.fetch_add(1, Ordering::SeqCst);
            next
        })]);
        t.run("first", |_ctx, _t| {});
        t.run("second", |_ctx, _t| {});
    });

    assert_eq!(count.load(Ordering::SeqCst), 2, "每次 run 都应重新调用中间件工厂");
}

#[test]
fn cleanups_run_children_first_in_reverse_order() {
    let trail = Trail::default();
    let probe = trail.clone();
    host::test("TestCleanup", move |unit| {
        let t = root(unit);
        let parent = probe.clone();
        t.cleanup(move || parent.push("parent"));

        let nested = probe.clone();
        t.run("nested", move |_ctx, t| {
            let first = nested.clone();
            t.cleanup(move || first.push("child1"));
            let second = nested.clone();
            t.cleanup(move || second.push("child2"));
        });

        let another = probe.clone();
        t.run("another", move |_ctx, t| {
            let trail = another.clone();
            t.cleanup(move || trail.push("another"));
        });
    });

    assert_eq!(trail.snapshot(), vec!["child2", "child1", "another", "parent"]);
}

#[test]
fn child_cleanups_complete_before_parent_cleanups() {
    let trail = Trail::default();
    let probe = trail.clone();
    host::test("TestCleanupNesting", move |unit| {
        let t = root(unit);
        for label in ["c1", "c2"] {
            let trail = probe.clone();
            t.cleanup(move || trail.push(label));
        }
        let child = probe.clone();
        t.run("child", move |_ctx, t| {
            for label in ["d1", "d2"] {
                let trail = child.clone();
                t.cleanup(move || trail.push(label));
            }
        });
    });

    assert_eq!(trail.snapshot(), vec!["d2", "d1", "c2", "c1"]);
}

#[test]
fn context_values_accumulate_down_the_tree() {
    host::test("TestContextPropagation", |unit| {
        let t = root(unit);
        t.use_middleware([counting_depth()]);
        t.run("parent", |ctx, t| {
            assert_eq!(ctx.value::<Depth>(), Some(&Depth(1)));
            t.run("child", |ctx, t| {
                assert_eq!(ctx.value::<Depth>(), Some(&Depth(2)));
                t.run("grandchild", |ctx, t| {
                    assert_eq!(ctx.value::<Depth>(), Some(&Depth(3)));
                    assert_eq!(t.context().value::<Depth>(), Some(&Depth(3)));
                });
            });
        });
    });
}

#[test]
fn middleware_is_reapplied_at_every_depth() {
    let calls = Arc::new(AtomicUsize::new(0));
    let layer = counting(&calls);
    let (parent_view, child_view, grandchild_view) =
        (Arc::clone(&calls), Arc::clone(&calls), Arc::clone(&calls));
    host::test("TestMiddlewareNesting", move |unit| {
        let t = root(unit);
        t.use_middleware([layer]);
        t.run("parent", move |_ctx, t| {
            assert_eq!(parent_view.load(Ordering::SeqCst), 1, "父单元应调用一次中间件");
            let child_view = Arc::clone(&child_view);
            let grandchild_view = Arc::clone(&grandchild_view);
            t.run("child", move |_ctx, t| {
                assert_eq!(child_view.load(Ordering::SeqCst), 2, "子单元应再次调用中间件");
                let grandchild_view = Arc::clone(&grandchild_view);
                t.run("grandchild", move |_ctx, _t| {
                    assert_eq!(grandchild_view.load(Ordering::SeqCst), 3, "孙单元应再次调用中间件");
                });
            });
        });
    });
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// 验证运行期追加的中间件只作用于追加者之后派生的子树。
#[test]
fn middleware_added_inside_a_unit_reaches_only_its_subtree() {
    let trail = Trail::default();
    let probe = trail.clone();
    host::test("TestMiddlewareDynamicAddition", move |unit| {
        let t = root(unit);
        t.use_middleware([tag("first", &probe)]);

        let inner = probe.clone();
        t.run("parent", move |_ctx, t| {
            t.use_middleware([tag("dynamic", &inner)]);
            let body = inner.clone();
            t.run("child", move |_ctx, _t| body.push("test"));
        });

        let sibling = probe.clone();
        t.run("parent 2", move |_ctx, _t| sibling.push("parent 2"));
    });

    assert_eq!(
        trail.snapshot(),
        vec!["first", "first", "dynamic", "test", "first", "parent 2"]
    );
}

#[test]
fn values_bound_in_a_subtree_are_invisible_to_siblings_and_ancestors() {
    host::test("TestValueScoping", |unit| {
        let t = root(unit);
        t.run("marked", |ctx, t| {
            assert!(ctx.value::<Marker>().is_none());
            let marked = t.using([marking()]);
            marked.run("inner", |ctx, t| {
                assert_eq!(ctx.value::<Marker>(), Some(&Marker));
                t.run("deeper", |ctx, _t| assert_eq!(ctx.value::<Marker>(), Some(&Marker)));
            });
            t.run("unmarked sibling", |ctx, _t| assert!(ctx.value::<Marker>().is_none()));
        });
        t.run("plain", |ctx, _t| assert!(ctx.value::<Marker>().is_none()));
        assert!(t.context().value::<Marker>().is_none());
    });
}

#[test]
fn using_leaves_the_receiver_untouched() {
    let trail = Trail::default();
    let probe = trail.clone();
    host::test("TestUsing", move |unit| {
        let t = root(unit);
        let derived = t.using([tag("derived", &probe)]);

        let plain = probe.clone();
        t.run("base", move |_ctx, _t| plain.push("base body"));
        let wrapped = probe.clone();
        derived.run("derived", move |_ctx, _t| wrapped.push("derived body"));
    });

    assert_eq!(trail.snapshot(), vec!["base body", "derived", "derived body"]);
}

/// 验证父包装器在子单元构造之后追加的中间件不影响该子单元，但影响之后的子单元。
#[test]
fn registration_after_branching_does_not_alter_existing_children() {
    let trail = Trail::default();
    let probe = trail.clone();
    host::test("TestLateRegistration", move |unit| {
        let t = root(unit);
        let parent = t.clone();
        let late = probe.clone();
        t.run("existing", move |_ctx, child| {
            parent.use_middleware([tag("late", &late)]);
            let body = late.clone();
            child.run("grandchild", move |_ctx, _t| body.push("grandchild body"));
        });
        let body = probe.clone();
        t.run("later", move |_ctx, _t| body.push("later body"));
    });

    assert_eq!(trail.snapshot(), vec!["grandchild body", "late", "later body"]);
}

/// 验证超时中间件通过上下文传达截止时间，测试体据此报告失败。
///
/// # 教案式说明
/// - **测试设计（How）**：测试体在 10 秒等待与上下文结束之间二选一；
/// - **验收契约（What）**：约 100ms 后观察到 `DeadlineExceeded`，单元失败且远早于 10 秒返回。
#[test]
fn timeout_middleware_cancels_long_running_body() {
    let started = Instant::now();
    let report = host::run_test("TestTimeout", |unit| {
        let t = T::new(
            unit,
            &Context::background(),
            vec![middleware::timeout(Duration::from_millis(100))],
        );
        t.run("slow", |ctx, t| match ctx.wait_timeout(Duration::from_secs(10)) {
            Some(ContextError::DeadlineExceeded) => t.error("deadline exceeded"),
            other => t.log(&format!("unexpected wake-up: {other:?}")),
        });
    });

    assert!(started.elapsed() < Duration::from_secs(5), "测试体应在截止时间后尽快返回");
    let slow = report.find("TestTimeout/slow").expect("应存在 slow 单元");
    assert!(slow.failed());
    assert_eq!(slow.output(), ["deadline exceeded"]);
    assert!(report.failed(), "失败应向上传播");
}

#[test]
fn sibling_branches_get_independent_contexts() {
    let seen: Arc<Mutex<Vec<Context>>> = Arc::default();
    let probe = Arc::clone(&seen);
    let report = host::run_test("Root", move |unit| {
        let t = root(unit);
        for name in ["a", "b", "c"] {
            let probe = Arc::clone(&probe);
            t.run(name, move |ctx, t| {
                let probe = Arc::clone(&probe);
                let parent_ctx = ctx.clone();
                t.run("x", move |ctx, _t| {
                    assert!(!ctx.is_done());
                    probe.lock().push(ctx);
                });
                assert!(!parent_ctx.is_done(), "子单元结束不应取消父单元上下文");
            });
        }
        assert!(!t.context().is_done());
    });

    report.assert_passed();
    assert_eq!(
        report.names(),
        vec!["Root", "Root/a", "Root/a/x", "Root/b", "Root/b/x", "Root/c", "Root/c/x"]
    );
    let contexts = seen.lock();
    assert_eq!(contexts.len(), 3);
    assert!(contexts.iter().all(Context::is_done), "每个分支的上下文都应随其单元结束而取消");
}

#[test]
fn wrapper_context_is_cancelled_when_unit_completes() {
    let captured: Arc<Mutex<Option<Context>>> = Arc::default();
    let probe = Arc::clone(&captured);
    host::test("TestLifecycle", move |unit| {
        let t = root(unit);
        assert!(!t.context().is_done());
        *probe.lock() = Some(t.context().clone());
    });
    let ctx = captured.lock().take().expect("应捕获根上下文");
    assert_eq!(ctx.err(), Some(ContextError::Canceled));
}

#[test]
fn logger_mirrors_messages_in_call_order() {
    let sink = Arc::new(RecordingLogger::new());
    let logger = Arc::clone(&sink);
    let report = host::run_test("TestLogger", move |unit| {
        let t = root(unit).using([middleware::log_to(logger)]);
        t.run("logs", |_ctx, t| {
            t.log("plain");
            t.logf(format_args!("formatted {}", 42));
            t.error("recoverable");
        });
        t.run("fatal", |_ctx, t| {
            t.fatalf(format_args!("fatal {}", "stop"));
        });
        t.run("skipped", |_ctx, t| t.skip("not applicable"));
    });

    assert!(report.failed());
    let entries = sink.entries();
    let levels: Vec<_> = entries.iter().map(|e| (e.level, e.message.as_str())).collect();
    assert_eq!(
        levels,
        vec![
            (LogLevel::Log, "plain"),
            (LogLevel::Log, "formatted 42"),
            (LogLevel::Error, "recoverable"),
            (LogLevel::Error, "fatal stop"),
            (LogLevel::Log, "not applicable"),
        ]
    );
    let logs = report.find("TestLogger/logs").expect("logs 单元应存在");
    assert_eq!(logs.output(), ["plain", "formatted 42", "recoverable"]);
    assert!(report.find("TestLogger/skipped").is_some_and(|r| r.skipped()));
}

#[test]
fn fatal_stops_the_body_but_not_its_siblings() {
    let trail = Trail::default();
    let probe = trail.clone();
    let report = host::run_test("TestFatal", move |unit| {
        let t = root(unit);
        let fatal = probe.clone();
        let survived = t.run("fatal", move |_ctx, t| {
            fatal.push("before");
            t.fatal("stop here");
        });
        probe.push(if survived { "passed" } else { "reported failure" });
        let sibling = probe.clone();
        t.run("sibling", move |_ctx, _t| sibling.push("sibling ran"));
    });

    assert_eq!(trail.snapshot(), vec!["before", "reported failure", "sibling ran"]);
    assert!(report.failed());
    assert!(report.find("TestFatal/sibling").is_some_and(|r| r.passed()));
}

#[test]
fn instrumentation_sees_each_unit_name() {
    let trail = Trail::default();
    let probe = trail.clone();
    host::test("TestInstrumentation", move |unit| {
        let t = root(unit).using([middleware::instrumentation(move |ctx: &Context, name: &str| {
            assert!(!ctx.is_done());
            probe.push(name);
        })]);
        t.run("outer", |_ctx, t| {
            t.run("inner", |_ctx, _t| {});
        });
    });

    assert_eq!(
        trail.snapshot(),
        vec!["TestInstrumentation/outer", "TestInstrumentation/outer/inner"]
    );
}

#[test]
fn base_name_and_unit_expose_host_identity() {
    host::test("TestNames", |unit| {
        let t = root(unit);
        assert_eq!(t.base_name(), "TestNames");
        t.run("with space", |_ctx, t| {
            assert_eq!(t.name(), "TestNames/with_space");
            assert_eq!(t.base_name(), "with_space");
            assert_eq!(testctx::Unit::name(t.unit()), t.name());
        });
    });
}

#[test]
fn parallel_middleware_runs_siblings_concurrently() {
    let barrier = Arc::new(std::sync::Barrier::new(2));
    let trail = Trail::default();
    let probe = trail.clone();
    host::test("TestParallel", move |unit| {
        let t = root(unit).using([middleware::parallel()]);
        for name in ["left", "right"] {
            let barrier = Arc::clone(&barrier);
            let probe = probe.clone();
            t.run(name, move |_ctx, _t| {
                barrier.wait();
                probe.push("joined");
            });
        }
        probe.push("parent body done");
    });

    assert_eq!(trail.snapshot(), vec!["parent body done", "joined", "joined"]);
}
