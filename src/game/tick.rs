//! Authoritative Simulation Tick
//!
//! One call advances a match by exactly one tick. Fixed-point only, with the
//! RNG carried in the state, so the same seed and inputs always replay the
//! same match.

use crate::core::fixed::{
    Fixed, FIXED_ONE, BALL_RADIUS, COURT_HALF_HEIGHT, COURT_HALF_WIDTH,
    HIT_SPEEDUP, MAX_BALL_SPEED, MAX_VERTICAL_RATIO, PADDLE_HALF_HEIGHT,
    PADDLE_SPEED, PADDLE_X, SERVE_SPEED,
    fixed_abs, fixed_clamp, fixed_div, fixed_mul, per_tick,
};
use crate::core::vec2::FixedVec2;
use crate::game::events::{GameEvent, GameEventData};
use crate::game::input::PaddleDirection;
use crate::game::state::{paddle_travel_limit, MatchPhase, PongState, Side};
use crate::{TICK_RATE, WIN_SCORE};

/// Result of a tick.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Events generated this tick
    pub events: Vec<GameEvent>,
    /// Side that scored this tick
    pub scored: Option<Side>,
    /// Whether the match is over
    pub match_ended: bool,
    /// Winner, once the match is over
    pub winner: Option<Side>,
}

/// Rules for one match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Points needed to win
    pub win_score: u32,
    /// Ticks the ball rests at center before each serve
    pub serve_delay_ticks: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_rate: TICK_RATE,
            win_score: WIN_SCORE,
            serve_delay_ticks: TICK_RATE,
        }
    }
}

/// Run one simulation tick.
///
/// `inputs` are the current paddle intents in slot order (left, right).
/// Once the match has ended the state is left untouched.
pub fn tick(
    state: &mut PongState,
    inputs: &[PaddleDirection; 2],
    config: &GameConfig,
) -> TickResult {
    let mut result = TickResult::default();

    if let MatchPhase::Ended { winner } = state.phase {
        result.match_ended = true;
        result.winner = Some(winner);
        return result;
    }

    state.tick += 1;

    move_paddles(state, inputs, config);

    match state.phase {
        MatchPhase::Serving { ticks_remaining, toward } => {
            if ticks_remaining == 0 {
                serve(state, toward, &mut result);
            } else {
                state.phase = MatchPhase::Serving {
                    ticks_remaining: ticks_remaining - 1,
                    toward,
                };
            }
        }
        MatchPhase::Rally => {
            advance_ball(state, config, &mut result);
            if let Some(scorer) = check_goal(state) {
                award_point(state, scorer, config, &mut result);
            }
        }
        MatchPhase::Ended { .. } => {}
    }

    #[cfg(feature = "debug-tracing")]
    tracing::trace!(
        tick = state.tick,
        ball = %state.ball.position,
        score = ?state.score,
        "tick"
    );

    result
}

/// Move both paddles by their intent, clamped to the court.
fn move_paddles(state: &mut PongState, inputs: &[PaddleDirection; 2], config: &GameConfig) {
    let step = per_tick(PADDLE_SPEED, config.tick_rate);
    let limit = paddle_travel_limit();

    for side in Side::BOTH {
        let paddle = &mut state.paddles[side.index()];
        let moved = paddle.y.wrapping_add(inputs[side.index()].displacement(step));
        paddle.y = fixed_clamp(moved, -limit, limit);
    }
}

/// Launch the ball from center toward `toward`.
fn serve(state: &mut PongState, toward: Side, result: &mut TickResult) {
    let spread = SERVE_SPEED / 2;
    let vy = state.rng.next_fixed_range(-spread, spread);
    let vx = SERVE_SPEED * toward.goal_sign();

    state.ball.velocity = FixedVec2::new(vx, vy);
    state.phase = MatchPhase::Rally;
    result
        .events
        .push(GameEvent::ball_served(state.tick, toward, state.ball.velocity));
}

/// Move the ball one tick and resolve wall and paddle contacts.
fn advance_ball(state: &mut PongState, config: &GameConfig, result: &mut TickResult) {
    let previous = state.ball.position;
    let velocity = state.ball.velocity;
    let step = FixedVec2::new(
        per_tick(velocity.x, config.tick_rate),
        per_tick(velocity.y, config.tick_rate),
    );
    state.ball.position = previous + step;

    // Walls: reflect the overshoot back into the court
    let top = COURT_HALF_HEIGHT - BALL_RADIUS;
    let y = state.ball.position.y;
    if y > top {
        state.ball.position.y = fixed_clamp(top.wrapping_mul(2) - y, -top, top);
        state.ball.velocity.y = -fixed_abs(state.ball.velocity.y);
        result.events.push(GameEvent::new(state.tick, GameEventData::WallBounce));
    } else if y < -top {
        state.ball.position.y = fixed_clamp(-top.wrapping_mul(2) - y, -top, top);
        state.ball.velocity.y = fixed_abs(state.ball.velocity.y);
        result.events.push(GameEvent::new(state.tick, GameEventData::WallBounce));
    }

    for side in Side::BOTH {
        if crossed_paddle_face(previous.x, state.ball.position.x, side)
            && paddle_covers(state, side)
        {
            return_ball(state, side, result);
            break;
        }
    }
}

/// Whether the ball's leading edge crossed `side`'s paddle face this tick.
fn crossed_paddle_face(prev_x: Fixed, new_x: Fixed, side: Side) -> bool {
    let sign = side.goal_sign();
    // Depth measured toward this side's goal
    let prev_edge = prev_x * sign + BALL_RADIUS;
    let new_edge = new_x * sign + BALL_RADIUS;
    prev_edge <= PADDLE_X && new_edge > PADDLE_X
}

/// Whether `side`'s paddle spans the ball's Y.
fn paddle_covers(state: &PongState, side: Side) -> bool {
    let offset = state.ball.position.y - state.paddle(side).y;
    fixed_abs(offset) <= PADDLE_HALF_HEIGHT + BALL_RADIUS
}

/// Bounce the ball off `side`'s paddle.
///
/// Horizontal speed grows by the hit speed-up up to the cap. The hit offset
/// from the paddle center adds vertical english, and vertical speed is capped
/// as a ratio of horizontal speed.
fn return_ball(state: &mut PongState, side: Side, result: &mut TickResult) {
    let sign = side.goal_sign();
    let reach = PADDLE_HALF_HEIGHT + BALL_RADIUS;

    let speed = fixed_mul(fixed_abs(state.ball.velocity.x), HIT_SPEEDUP).min(MAX_BALL_SPEED);
    let offset = fixed_clamp(
        fixed_div(state.ball.position.y - state.paddle(side).y, reach),
        -FIXED_ONE,
        FIXED_ONE,
    );
    let vertical_cap = fixed_mul(speed, MAX_VERTICAL_RATIO);
    let vy = state
        .ball
        .velocity
        .y
        .wrapping_add(fixed_mul(offset, vertical_cap));

    state.ball.position.x = (PADDLE_X - BALL_RADIUS) * sign;
    state.ball.velocity = FixedVec2::new(-speed * sign, fixed_clamp(vy, -vertical_cap, vertical_cap));
    state.rally_hits += 1;

    result
        .events
        .push(GameEvent::paddle_hit(state.tick, side, state.rally_hits));
}

/// Side that scored, if the ball crossed a goal line.
fn check_goal(state: &PongState) -> Option<Side> {
    let x = state.ball.position.x;
    if x < -COURT_HALF_WIDTH {
        Some(Side::Right)
    } else if x > COURT_HALF_WIDTH {
        Some(Side::Left)
    } else {
        None
    }
}

/// Award a point, then end the match or re-serve toward the conceding side.
fn award_point(state: &mut PongState, scorer: Side, config: &GameConfig, result: &mut TickResult) {
    state.score[scorer.index()] += 1;
    result.scored = Some(scorer);
    result
        .events
        .push(GameEvent::point_scored(state.tick, scorer, state.score));

    let conceding = scorer.opponent();
    state.reset_for_serve(conceding, config.serve_delay_ticks);

    if state.score_of(scorer) >= config.win_score {
        state.phase = MatchPhase::Ended { winner: scorer };
        result.match_ended = true;
        result.winner = Some(scorer);
        result
            .events
            .push(GameEvent::match_won(state.tick, scorer, state.score));
    }
}
