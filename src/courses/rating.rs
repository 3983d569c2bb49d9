use serde::Serialize;
use sqlx::PgConnection;
use tracing::info;
use uuid::Uuid;

/// Course rating summary: mean rounded half-up to one decimal, and the number of ratings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatingAggregate {
    pub average: f64,
    pub count: i32,
}

/// Full pass over every rating of one course. Same input, same output.
pub fn aggregate_ratings(values: &[i16]) -> RatingAggregate {
    if values.is_empty() {
        return RatingAggregate {
            average: 0.0,
            count: 0,
        };
    }
    let count = values.len() as i64;
    let sum: i64 = values.iter().map(|v| *v as i64).sum();
    // tenths, rounded half-up in integer arithmetic
    let tenths = (sum * 20 + count) / (2 * count);
    RatingAggregate {
        average: tenths as f64 / 10.0,
        count: count as i32,
    }
}

/// Locks the course row so concurrent submissions serialize on it.
/// `false` when the course does not exist.
pub async fn lock_course(conn: &mut PgConnection, course_id: Uuid) -> Result<bool, sqlx::Error> {
    let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM courses WHERE id = $1 FOR UPDATE")
        .bind(course_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Recomputes `courses.rating_*` from every enrollment rating. Call with the course row locked.
pub async fn recompute(
    conn: &mut PgConnection,
    course_id: Uuid,
) -> Result<RatingAggregate, sqlx::Error> {
    let values: Vec<(i16,)> = sqlx::query_as(
        "SELECT rating_value FROM enrollments WHERE course_id = $1 AND rating_value IS NOT NULL",
    )
    .bind(course_id)
    .fetch_all(&mut *conn)
    .await?;
    let values: Vec<i16> = values.into_iter().map(|(v,)| v).collect();
    let aggregate = aggregate_ratings(&values);

    sqlx::query(
        "UPDATE courses SET rating_average = $2, rating_count = $3, updated_at = now() WHERE id = $1",
    )
    .bind(course_id)
    .bind(aggregate.average)
    .bind(aggregate.count)
    .execute(&mut *conn)
    .await?;

    info!(%course_id, average = aggregate.average, count = aggregate.count, "course rating recomputed");
    Ok(aggregate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_is_zero() {
        assert_eq!(
            aggregate_ratings(&[]),
            RatingAggregate {
                average: 0.0,
                count: 0
            }
        );
    }

    #[test]
    fn four_and_five_average_four_and_a_half() {
        let a = aggregate_ratings(&[4, 5]);
        assert_eq!(a.average, 4.5);
        assert_eq!(a.count, 2);
        assert_eq!(aggregate_ratings(&[5, 4]), a);
    }

    #[test]
    fn rounds_half_up_to_one_decimal() {
        // 17 / 4 = 4.25
        assert_eq!(aggregate_ratings(&[4, 4, 4, 5]).average, 4.3);
        // 13 / 3 = 4.333..
        assert_eq!(aggregate_ratings(&[4, 4, 5]).average, 4.3);
        // 14 / 3 = 4.666..
        assert_eq!(aggregate_ratings(&[4, 5, 5]).average, 4.7);
        assert_eq!(aggregate_ratings(&[1]).average, 1.0);
    }

    #[test]
    fn idempotent() {
        let values = [3, 1, 5, 2, 2];
        assert_eq!(aggregate_ratings(&values), aggregate_ratings(&values));
    }
}
